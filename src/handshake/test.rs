use super::{hello_command, Handshaker, HandshakerOptions};
use crate::{
    auth::Credential,
    options::{DriverInfo, ServerApi, ServerApiVersion},
};

#[test]
fn hello_carries_the_server_api() {
    let api = ServerApi::builder()
        .version(ServerApiVersion::V1)
        .strict(Some(true))
        .build();
    let command = hello_command(Some(&api));

    assert_eq!(command.name(), "hello");
    assert_eq!(command.target_db(), "admin");
    assert_eq!(command.body.get_str("apiVersion").unwrap(), "1");
    assert_eq!(command.body.get_bool("apiStrict").unwrap(), true);
}

#[test]
fn handshake_command_carries_client_metadata() {
    let handshaker = Handshaker::new(HandshakerOptions {
        app_name: Some("unit-tests".to_string()),
        ..Default::default()
    })
    .unwrap();

    let (command, client_first) = handshaker.build_command(None).unwrap();
    assert!(client_first.is_none());

    let client = command.body.get_document("client").unwrap();
    assert_eq!(
        client
            .get_document("application")
            .unwrap()
            .get_str("name")
            .unwrap(),
        "unit-tests"
    );
    assert!(client.get_document("driver").unwrap().contains_key("version"));
    assert!(client.get_document("os").unwrap().contains_key("type"));
}

#[test]
fn oversized_app_names_are_rejected() {
    let result = Handshaker::new(HandshakerOptions {
        app_name: Some("x".repeat(129)),
        ..Default::default()
    });
    assert!(result.is_err());
}

#[test]
fn credentials_add_negotiation_and_speculative_auth() {
    let handshaker = Handshaker::new(HandshakerOptions::default()).unwrap();
    let credential = Credential::builder()
        .username("app_user")
        .password("hunter2")
        .build();

    let (command, client_first) = handshaker.build_command(Some(&credential)).unwrap();

    assert_eq!(
        command.body.get_str("saslSupportedMechs").unwrap(),
        "admin.app_user"
    );

    let speculative = command.body.get_document("speculativeAuthenticate").unwrap();
    assert_eq!(speculative.get_i32("saslStart").unwrap(), 1);
    assert_eq!(speculative.get_str("mechanism").unwrap(), "SCRAM-SHA-256");
    assert_eq!(speculative.get_str("db").unwrap(), "admin");
    assert!(client_first.is_some());
}

#[cfg(feature = "zlib-compression")]
#[test]
fn offered_compressors_are_listed_in_the_hello() {
    let handshaker = Handshaker::new(HandshakerOptions {
        compressors: Some(vec![crate::compression::Compressor::Zlib { level: None }]),
        ..Default::default()
    })
    .unwrap();

    let (command, _) = handshaker.build_command(None).unwrap();
    let compression = command.body.get_array("compression").unwrap();
    assert_eq!(compression.len(), 1);
}

#[test]
fn wrapper_driver_info_is_appended() {
    let handshaker = Handshaker::new(HandshakerOptions {
        driver_info: Some(
            DriverInfo::builder()
                .name("wrapper")
                .version("9.9.9")
                .build(),
        ),
        ..Default::default()
    })
    .unwrap();

    let (command, _) = handshaker.build_command(None).unwrap();
    let driver = command
        .body
        .get_document("client")
        .unwrap()
        .get_document("driver")
        .unwrap();
    assert!(driver.get_str("name").unwrap().ends_with("|wrapper"));
    assert!(driver.get_str("version").unwrap().ends_with("|9.9.9"));
}
