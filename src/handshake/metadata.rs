//! The `client` document sent in the handshake: driver, OS, platform,
//! application, and runtime-environment description.

use std::env;

use bson::{doc, Bson, Document};

use crate::{
    error::{ErrorKind, Result},
    options::DriverInfo,
};

/// The maximum length of a user-supplied application name, in bytes.
pub(crate) const MAX_APP_NAME_LENGTH: usize = 128;

/// The byte budget for the whole metadata document inside the handshake.
/// When exceeded, fields are dropped in priority order until it fits.
const MAX_METADATA_SIZE: usize = 512;

/// The metadata describing this driver, frozen after construction except for
/// wrapper-library info appended via
/// [`append_driver_info`](ClientMetadata::append_driver_info).
#[derive(Clone, Debug, PartialEq)]
pub struct ClientMetadata {
    pub(crate) application: Option<AppMetadata>,
    pub(crate) driver: DriverMetadata,
    pub(crate) os: OsMetadata,
    pub(crate) platform: String,
    pub(crate) env: Option<RuntimeEnvironment>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct AppMetadata {
    pub(crate) name: String,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct DriverMetadata {
    pub(crate) name: String,
    pub(crate) version: String,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct OsMetadata {
    pub(crate) os_type: String,
    pub(crate) name: Option<String>,
    pub(crate) architecture: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct RuntimeEnvironment {
    pub(crate) name: Option<FaasEnvironmentName>,
    pub(crate) runtime: Option<String>,
    pub(crate) timeout_sec: Option<i32>,
    pub(crate) memory_mb: Option<i32>,
    pub(crate) region: Option<String>,
    pub(crate) container: Option<Document>,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) enum FaasEnvironmentName {
    AwsLambda,
    AzureFunc,
    GcpFunc,
    Vercel,
}

/// Maps an OS name to the closed set of type strings the server understands.
fn os_type(os_name: &str) -> &'static str {
    match os_name {
        "linux" => "Linux",
        "darwin" | "macos" => "Darwin",
        "windows" => "Windows",
        "hp-ux" | "aix" | "irix" | "solaris" | "sunos" => "Unix",
        _ => "unknown",
    }
}

impl ClientMetadata {
    /// Builds the metadata for this process, detecting the runtime
    /// environment from ambient signals. Fails if `app_name` exceeds the
    /// 128-byte limit.
    pub fn new(app_name: Option<String>) -> Result<Self> {
        if let Some(ref name) = app_name {
            if name.len() > MAX_APP_NAME_LENGTH {
                return Err(ErrorKind::InvalidArgument {
                    message: format!(
                        "application name must be at most {} bytes, got {}",
                        MAX_APP_NAME_LENGTH,
                        name.len()
                    ),
                }
                .into());
            }
        }

        Ok(Self {
            application: app_name.map(|name| AppMetadata { name }),
            driver: DriverMetadata {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            os: OsMetadata {
                os_type: os_type(std::env::consts::OS).to_string(),
                name: Some(std::env::consts::OS.to_string()),
                architecture: Some(std::env::consts::ARCH.to_string()),
            },
            platform: format!("rust with tokio / {}", std::env::consts::ARCH),
            env: RuntimeEnvironment::detect(),
        })
    }

    /// Appends wrapper-library info to the driver fields. This is the only
    /// mutation allowed after construction.
    pub fn append_driver_info(&mut self, driver_info: &DriverInfo) {
        self.driver.name.push('|');
        self.driver.name.push_str(&driver_info.name);

        if let Some(ref version) = driver_info.version {
            self.driver.version.push('|');
            self.driver.version.push_str(version);
        }

        if let Some(ref platform) = driver_info.platform {
            self.platform.push('|');
            self.platform.push_str(platform);
        }
    }

    pub(crate) fn to_document(&self) -> Document {
        let mut doc = Document::new();

        if let Some(ref application) = self.application {
            doc.insert("application", doc! { "name": application.name.clone() });
        }

        doc.insert(
            "driver",
            doc! {
                "name": self.driver.name.clone(),
                "version": self.driver.version.clone(),
            },
        );

        let mut os = doc! { "type": self.os.os_type.clone() };
        if let Some(ref name) = self.os.name {
            os.insert("name", name.clone());
        }
        if let Some(ref architecture) = self.os.architecture {
            os.insert("architecture", architecture.clone());
        }
        doc.insert("os", os);

        if !self.platform.is_empty() {
            doc.insert("platform", self.platform.clone());
        }

        if let Some(ref env) = self.env {
            doc.insert("env", env.to_document());
        }

        doc
    }

    /// Serializes the metadata, dropping fields in priority order (wrapper
    /// driver info, then platform, then OS details, then the environment)
    /// until the document fits the byte budget.
    pub(crate) fn to_document_within_budget(&self) -> Document {
        let mut metadata = self.clone();
        let mut doc = metadata.to_document();
        for truncation in METADATA_TRUNCATIONS {
            if document_size(&doc) <= MAX_METADATA_SIZE {
                break;
            }
            truncation(&mut metadata);
            doc = metadata.to_document();
        }
        doc
    }
}

fn document_size(doc: &Document) -> usize {
    let mut bytes = Vec::new();
    // Serialization of an in-memory document cannot fail.
    let _ = doc.to_writer(&mut bytes);
    bytes.len()
}

type Truncation = fn(&mut ClientMetadata);

const METADATA_TRUNCATIONS: &[Truncation] = &[
    // Drop appended wrapper-driver info.
    |metadata| {
        truncate_at_pipe(&mut metadata.driver.name);
        truncate_at_pipe(&mut metadata.driver.version);
        truncate_at_pipe(&mut metadata.platform);
    },
    // Drop the platform string.
    |metadata| {
        metadata.platform.clear();
    },
    // Drop OS details, keeping the type.
    |metadata| {
        metadata.os.name = None;
        metadata.os.architecture = None;
    },
    // Drop everything environmental except the FaaS name.
    |metadata| {
        if let Some(env) = &mut metadata.env {
            *env = RuntimeEnvironment {
                name: env.name,
                runtime: None,
                timeout_sec: None,
                memory_mb: None,
                region: None,
                container: None,
            };
        }
    },
    // Drop the environment entirely.
    |metadata| {
        metadata.env = None;
    },
];

fn truncate_at_pipe(value: &mut String) {
    if let Some(index) = value.find('|') {
        value.truncate(index);
    }
}

fn var_set(name: &str) -> bool {
    env::var_os(name).is_some_and(|v| !v.is_empty())
}

impl RuntimeEnvironment {
    /// Detects FaaS and container signals from the process environment.
    /// Conflicting FaaS signals (other than Vercel-on-Lambda) strip the
    /// environment; unparsable values strip their keys.
    pub(crate) fn detect() -> Option<Self> {
        let mut out = RuntimeEnvironment {
            name: None,
            runtime: None,
            timeout_sec: None,
            memory_mb: None,
            region: None,
            container: None,
        };

        if let Some(name) = FaasEnvironmentName::detect() {
            out.name = Some(name);
            match name {
                FaasEnvironmentName::AwsLambda => {
                    out.runtime = env::var("AWS_EXECUTION_ENV").ok();
                    out.region = env::var("AWS_REGION").ok();
                    out.memory_mb = env::var("AWS_LAMBDA_FUNCTION_MEMORY_SIZE")
                        .ok()
                        .and_then(|s| s.parse().ok());
                }
                FaasEnvironmentName::AzureFunc => {
                    out.runtime = env::var("FUNCTIONS_WORKER_RUNTIME").ok();
                }
                FaasEnvironmentName::GcpFunc => {
                    out.memory_mb = env::var("FUNCTION_MEMORY_MB")
                        .ok()
                        .and_then(|s| s.parse().ok());
                    out.timeout_sec = env::var("FUNCTION_TIMEOUT_SEC")
                        .ok()
                        .and_then(|s| s.parse().ok());
                    out.region = env::var("FUNCTION_REGION").ok();
                }
                FaasEnvironmentName::Vercel => {
                    out.region = env::var("VERCEL_REGION").ok();
                }
            }
        }

        let mut container = Document::new();
        if std::path::Path::new("/.dockerenv").exists() {
            container.insert("runtime", "docker");
        }
        if var_set("KUBERNETES_SERVICE_HOST") {
            container.insert("orchestrator", "kubernetes");
        }
        if !container.is_empty() {
            out.container = Some(container);
        }

        if out.name.is_none() && out.container.is_none() {
            None
        } else {
            Some(out)
        }
    }

    fn to_document(&self) -> Document {
        let mut doc = Document::new();
        if let Some(name) = self.name {
            doc.insert("name", name.as_str());
        }
        if let Some(ref runtime) = self.runtime {
            doc.insert("runtime", runtime.clone());
        }
        if let Some(timeout_sec) = self.timeout_sec {
            doc.insert("timeout_sec", Bson::Int32(timeout_sec));
        }
        if let Some(memory_mb) = self.memory_mb {
            doc.insert("memory_mb", Bson::Int32(memory_mb));
        }
        if let Some(ref region) = self.region {
            doc.insert("region", region.clone());
        }
        if let Some(ref container) = self.container {
            doc.insert("container", container.clone());
        }
        doc
    }
}

impl FaasEnvironmentName {
    pub(crate) fn detect() -> Option<Self> {
        use FaasEnvironmentName::*;

        let mut found: Option<Self> = None;
        let lambda_env = env::var_os("AWS_EXECUTION_ENV")
            .is_some_and(|v| v.to_string_lossy().starts_with("AWS_Lambda_"));
        if lambda_env || var_set("AWS_LAMBDA_RUNTIME_API") {
            found = Some(AwsLambda);
        }
        if var_set("VERCEL") {
            // Vercel deploys onto Lambda; Vercel wins.
            found = Some(Vercel);
        }
        // Any other combination of signals is a conflict and strips the env.
        if var_set("FUNCTIONS_WORKER_RUNTIME") {
            match found {
                None => found = Some(AzureFunc),
                _ => return None,
            }
        }
        if var_set("K_SERVICE") || var_set("FUNCTION_NAME") {
            match found {
                None => found = Some(GcpFunc),
                _ => return None,
            }
        }
        found
    }

    fn as_str(&self) -> &'static str {
        match self {
            FaasEnvironmentName::AwsLambda => "aws.lambda",
            FaasEnvironmentName::AzureFunc => "azure.func",
            FaasEnvironmentName::GcpFunc => "gcp.func",
            FaasEnvironmentName::Vercel => "vercel",
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::options::DriverInfo;

    #[test]
    fn os_names_map_to_the_closed_type_set() {
        assert_eq!(os_type("linux"), "Linux");
        assert_eq!(os_type("darwin"), "Darwin");
        assert_eq!(os_type("windows"), "Windows");
        for unix in ["hp-ux", "aix", "irix", "solaris", "sunos"] {
            assert_eq!(os_type(unix), "Unix");
        }
        assert_eq!(os_type("plan9"), "unknown");
        assert_eq!(os_type(""), "unknown");
    }

    #[test]
    fn app_names_over_the_limit_are_rejected() {
        assert!(ClientMetadata::new(Some("a".repeat(MAX_APP_NAME_LENGTH))).is_ok());
        assert!(ClientMetadata::new(Some("a".repeat(MAX_APP_NAME_LENGTH + 1))).is_err());
    }

    #[test]
    fn oversized_metadata_is_truncated_within_the_budget() {
        let mut metadata = ClientMetadata::new(Some("truncation-test".to_string())).unwrap();
        metadata.append_driver_info(
            &DriverInfo::builder()
                .name("w".repeat(200))
                .version("v".repeat(200))
                .platform("p".repeat(200))
                .build(),
        );

        let full = metadata.to_document();
        assert!(document_size(&full) > MAX_METADATA_SIZE);

        let truncated = metadata.to_document_within_budget();
        assert!(document_size(&truncated) <= MAX_METADATA_SIZE);
        // The first truncation strips the wrapper info but keeps the base
        // driver identity.
        let driver = truncated.get_document("driver").unwrap();
        assert!(!driver.get_str("name").unwrap().contains('|'));
    }

    #[test]
    fn truncation_priority_drops_wrapper_info_first() {
        let mut metadata = ClientMetadata::new(None).unwrap();
        metadata.append_driver_info(&DriverInfo::builder().name("wrapper").build());

        let mut working = metadata.clone();
        METADATA_TRUNCATIONS[0](&mut working);
        assert!(!working.driver.name.contains('|'));
        // OS details and platform survive the first stage.
        assert!(working.os.name.is_some());
        assert!(!working.platform.is_empty());
    }
}
