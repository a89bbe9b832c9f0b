use std::path::PathBuf;

use crate::reference::MediaType;

/// Options for a [`Puller`](super::Puller).
#[derive(Clone, Debug)]
pub struct PullConfig {
    /// Operating system to select in manifest lists.
    pub os: String,

    /// Architecture to select in manifest lists, with the names used by
    /// registries (`amd64`, `arm64`, ...).
    pub architecture: String,

    /// Config media types accepted in schema 2 manifests.
    pub schema2_types: Vec<String>,

    /// Reject schema 1 manifests.
    pub require_schema2: bool,

    /// Directory for partial downloads. The system default if `None`.
    pub temp_dir: Option<PathBuf>,
}

impl Default for PullConfig {
    fn default() -> Self {
        PullConfig {
            os: default_os().to_owned(),
            architecture: default_architecture().to_owned(),
            schema2_types: default_schema2_types(),
            require_schema2: false,
            temp_dir: None,
        }
    }
}

impl PullConfig {
    pub fn os(mut self, os: impl Into<String>) -> Self {
        self.os = os.into();
        self
    }

    pub fn architecture(mut self, architecture: impl Into<String>) -> Self {
        self.architecture = architecture.into();
        self
    }

    pub fn require_schema2(mut self, require: bool) -> Self {
        self.require_schema2 = require;
        self
    }

    pub fn temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }
}

/// Config types of images. Some old registries send generic types.
fn default_schema2_types() -> Vec<String> {
    [
        MediaType::DockerImageV1.as_str(),
        MediaType::OciConfig.as_str(),
        "application/octet-stream",
        "application/json",
        "text/html",
        "",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_os() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        os => os,
    }
}

fn default_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "x86" => "386",
        "aarch64" => "arm64",
        "powerpc64" if cfg!(target_endian = "little") => "ppc64le",
        "loongarch64" => "loong64",
        arch => arch,
    }
}

#[test]
fn host_platform_names() {
    let config = PullConfig::default();

    assert_ne!(config.architecture, "x86_64");
    assert_ne!(config.architecture, "aarch64");
    assert_ne!(config.os, "macos");

    assert!(config.schema2_types.iter().any(|t| t.is_empty()));
    assert!(config
        .schema2_types
        .contains(&MediaType::DockerImageV1.to_string()));
}
