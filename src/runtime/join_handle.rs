use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use crate::error::{ErrorKind, Result};

/// Wrapper around a spawned task's join handle that surfaces panics and
/// cancellation as internal errors instead of a separate join-error type.
#[derive(Debug)]
pub(crate) struct AsyncJoinHandle<T>(tokio::task::JoinHandle<T>);

impl<T> AsyncJoinHandle<T> {
    pub(crate) fn new(handle: tokio::task::JoinHandle<T>) -> Self {
        Self(handle)
    }
}

impl<T> Future for AsyncJoinHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx).map(|result| {
            result.map_err(|e| {
                ErrorKind::Internal {
                    message: format!("spawned task failed to complete: {}", e),
                }
                .into()
            })
        })
    }
}
