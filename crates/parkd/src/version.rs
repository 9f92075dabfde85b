//! Version information for parkd.

/// parkd version from Cargo.toml
pub const PARKD_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version information reported by the health check.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct VersionInfo {
    pub parkd: &'static str,
    /// Layout the running pool was built from, e.g. `A:20,B:24`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layout: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            parkd: PARKD_VERSION,
            layout: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_layout(mut self, layout: String) -> Self {
        self.layout = Some(layout);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_info_has_crate_version() {
        let info = VersionInfo::new();
        assert_eq!(info.parkd, PARKD_VERSION);
        assert!(info.layout.is_none());
    }

    #[test]
    fn version_info_serializes_minimal() {
        let info = VersionInfo {
            parkd: "0.1.0",
            layout: None,
        };
        insta::assert_json_snapshot!(info, @r#"
        {
          "parkd": "0.1.0"
        }
        "#);
    }

    #[test]
    fn version_info_serializes_layout() {
        let info = VersionInfo {
            parkd: "0.1.0",
            layout: None,
        }
        .with_layout("A:2,B:3".to_string());
        insta::assert_json_snapshot!(info, @r#"
        {
          "parkd": "0.1.0",
          "layout": "A:2,B:3"
        }
        "#);
    }
}
