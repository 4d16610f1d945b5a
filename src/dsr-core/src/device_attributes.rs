//! Device security posture carried in the attestation token.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Snapshot of the device's security-relevant settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAttributes {
    /// Build information.
    pub build: BuildAttributes,
    /// Read-only system properties.
    pub ro: ReadOnlyAttributes,
    /// Package manager features.
    pub package_manager: PackageManagerAttributes,
    /// Lock screen state.
    pub keyguard_manager: KeyguardManagerAttributes,
    /// Available authenticators.
    pub biometric_manager: BiometricManagerAttributes,
    /// Device policy.
    pub device_policy_manager: DevicePolicyManagerAttributes,
}

/// `Build` values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildAttributes {
    /// OS version.
    pub version: VersionAttributes,
    /// Device manufacturer.
    pub manufacturer: String,
    /// Product name.
    pub product: String,
    /// Model name.
    pub model: String,
    /// Board name.
    pub board: String,
}

/// OS version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionAttributes {
    /// SDK level.
    pub sdk_init: i32,
    /// Security patch date, `YYYY-MM-DD`.
    pub security_patch: String,
}

/// `ro.*` system properties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadOnlyAttributes {
    /// Storage encryption.
    pub crypto: CryptoAttributes,
    /// Product properties.
    pub product: ProductAttributes,
}

/// Storage encryption state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoAttributes {
    /// Whether storage encryption is active.
    pub state: bool,
}

/// Product properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductAttributes {
    /// SDK level the device shipped with; 0 when unknown.
    #[serde(rename = "firstAPILevel")]
    pub first_api_level: i32,
}

/// Package manager features.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageManagerAttributes {
    /// Verified boot support.
    pub feature_verified_boot: bool,
    /// Mainline module patch level.
    pub main_line_patch_level: String,
}

/// Lock screen state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyguardManagerAttributes {
    /// A PIN, pattern or password is set.
    pub is_device_secure: bool,
}

/// Available authenticators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BiometricManagerAttributes {
    /// Device credential authentication is possible.
    pub device_credential: bool,
    /// Class 3 biometrics are enrolled.
    pub biometric_strong: bool,
}

/// Device policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevicePolicyManagerAttributes {
    /// Password complexity bucket.
    pub password_complexity: i32,
}

/// Source of the device attribute snapshot (platform bridge).
pub trait DeviceAttributesSource: Send + Sync {
    /// Collect the current attributes.
    fn device_attributes(&self) -> DeviceAttributes;
}

/// Fixed attributes, for desktop builds and tests.
#[derive(Debug, Clone)]
pub struct StaticDeviceAttributes(pub DeviceAttributes);

impl DeviceAttributesSource for StaticDeviceAttributes {
    fn device_attributes(&self) -> DeviceAttributes {
        self.0.clone()
    }
}

impl Default for StaticDeviceAttributes {
    fn default() -> Self {
        Self(DeviceAttributes {
            build: BuildAttributes {
                version: VersionAttributes {
                    sdk_init: 34,
                    security_patch: "2024-05-01".into(),
                },
                manufacturer: "Google".into(),
                product: "husky".into(),
                model: "Pixel 8 Pro".into(),
                board: "husky".into(),
            },
            ro: ReadOnlyAttributes {
                crypto: CryptoAttributes { state: true },
                product: ProductAttributes { first_api_level: 34 },
            },
            package_manager: PackageManagerAttributes {
                feature_verified_boot: true,
                main_line_patch_level: parse_mainline_patch_level("2024-05-01"),
            },
            keyguard_manager: KeyguardManagerAttributes { is_device_secure: true },
            biometric_manager: BiometricManagerAttributes {
                device_credential: true,
                biometric_strong: true,
            },
            device_policy_manager: DevicePolicyManagerAttributes {
                password_complexity: 0,
            },
        })
    }
}

/// Normalize a mainline module version name to `YYYY-MM-DD`.
///
/// Version names start with `YYYY-MM-DD` or `YYYY-MM`; anything else is
/// returned unchanged.
pub fn parse_mainline_patch_level(version_name: &str) -> String {
    let trimmed = version_name.trim();
    let day = trimmed.get(..10).and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok());
    let month = || {
        trimmed
            .get(..7)
            .and_then(|s| NaiveDate::parse_from_str(&format!("{s}-01"), "%Y-%m-%d").ok())
    };
    match day.or_else(month) {
        Some(date) => date.format("%Y-%m-%d").to_string(),
        None => version_name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names() {
        let json = serde_json::to_value(StaticDeviceAttributes::default().device_attributes()).unwrap();
        assert_eq!(json["build"]["version"]["sdkInit"], 34);
        assert_eq!(json["ro"]["product"]["firstAPILevel"], 34);
        assert_eq!(json["ro"]["crypto"]["state"], true);
        assert_eq!(json["packageManager"]["mainLinePatchLevel"], "2024-05-01");
        assert_eq!(json["keyguardManager"]["isDeviceSecure"], true);
        assert_eq!(json["biometricManager"]["biometricStrong"], true);
        assert_eq!(json["devicePolicyManager"]["passwordComplexity"], 0);
    }

    #[test]
    fn test_mainline_patch_level() {
        assert_eq!(parse_mainline_patch_level("2023-11-01"), "2023-11-01");
        assert_eq!(parse_mainline_patch_level("2023-11"), "2023-11-01");
        assert_eq!(parse_mainline_patch_level("2023-11-01.r1"), "2023-11-01");
        assert_eq!(parse_mainline_patch_level("r_aml_341"), "r_aml_341");
    }
}
