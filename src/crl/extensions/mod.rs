//! CRL and CRL-entry extensions.
//!
//! The registry is built from the CA-wide defaults overlaid with an issuing
//! point's overrides. It decides which extensions go into full CRLs, delta
//! CRLs and individual entries, and exposes the IssuingDistributionPoint
//! reason filter that governs which revocations a point lists.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use tracing::warn;
use x509_cert::ext::Extension;
use x509_cert::ext::pkix::crl::dp::{ReasonFlags, Reasons};

use super::config::ExtensionConfig;
use super::errors::{CrlError, CrlResult};
use super::types::{RevocationReason, RevokedEntry};

pub mod generators;

pub use generators::{DistributionPointSettings, ExtensionContext, ExtensionGenerator};

use generators::{
    AuthorityKeyIdentifierGenerator, CrlNumberGenerator, CrlReasonGenerator,
    DeltaCrlIndicatorGenerator, FreshestCrlGenerator, InvalidityDateGenerator,
    IssuingDistributionPointGenerator,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ExtensionName {
    AuthorityKeyIdentifier,
    CrlNumber,
    DeltaCrlIndicator,
    IssuingDistributionPoint,
    FreshestCrl,
    CrlReason,
    InvalidityDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionKind {
    Crl,
    CrlEntry,
}

impl ExtensionName {
    pub const ALL: [ExtensionName; 7] = [
        Self::AuthorityKeyIdentifier,
        Self::CrlNumber,
        Self::DeltaCrlIndicator,
        Self::IssuingDistributionPoint,
        Self::FreshestCrl,
        Self::CrlReason,
        Self::InvalidityDate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthorityKeyIdentifier => "AuthorityKeyIdentifier",
            Self::CrlNumber => "CRLNumber",
            Self::DeltaCrlIndicator => "DeltaCRLIndicator",
            Self::IssuingDistributionPoint => "IssuingDistributionPoint",
            Self::FreshestCrl => "FreshestCRL",
            Self::CrlReason => "CRLReason",
            Self::InvalidityDate => "InvalidityDate",
        }
    }

    pub fn kind(self) -> ExtensionKind {
        match self {
            Self::CrlReason | Self::InvalidityDate => ExtensionKind::CrlEntry,
            _ => ExtensionKind::Crl,
        }
    }
}

impl fmt::Display for ExtensionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExtensionName {
    type Err = CrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|name| name.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| CrlError::Config(format!("unknown extension '{s}'")))
    }
}

/// Effective settings of one extension
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionSettings {
    pub enable: bool,
    pub critical: bool,
    pub point_name: Option<String>,
    pub only_contains_user_certs: bool,
    pub only_contains_ca_certs: bool,
    pub only_some_reasons: Option<String>,
    pub indirect_crl: bool,
}

impl ExtensionSettings {
    fn new(enable: bool, critical: bool) -> Self {
        Self {
            enable,
            critical,
            ..Default::default()
        }
    }

    fn overlay(&self, config: &ExtensionConfig) -> Self {
        Self {
            enable: config.enable.unwrap_or(self.enable),
            critical: config.critical.unwrap_or(self.critical),
            point_name: config.point_name.clone().or_else(|| self.point_name.clone()),
            only_contains_user_certs: config
                .only_contains_user_certs
                .unwrap_or(self.only_contains_user_certs),
            only_contains_ca_certs: config
                .only_contains_ca_certs
                .unwrap_or(self.only_contains_ca_certs),
            only_some_reasons: config
                .only_some_reasons
                .clone()
                .or_else(|| self.only_some_reasons.clone()),
            indirect_crl: config.indirect_crl.unwrap_or(self.indirect_crl),
        }
    }
}

/// CA-wide extension defaults applied before per-point overrides
pub type ExtensionDefaults = BTreeMap<ExtensionName, ExtensionSettings>;

pub fn default_extension_settings() -> ExtensionDefaults {
    BTreeMap::from([
        (
            ExtensionName::AuthorityKeyIdentifier,
            ExtensionSettings::new(false, false),
        ),
        (ExtensionName::CrlNumber, ExtensionSettings::new(true, false)),
        (
            ExtensionName::DeltaCrlIndicator,
            ExtensionSettings::new(false, true),
        ),
        (
            ExtensionName::IssuingDistributionPoint,
            ExtensionSettings::new(false, true),
        ),
        (ExtensionName::FreshestCrl, ExtensionSettings::new(false, false)),
        (ExtensionName::CrlReason, ExtensionSettings::new(true, false)),
        (ExtensionName::InvalidityDate, ExtensionSettings::new(true, false)),
    ])
}

/// Parses a comma-separated list of RFC 5280 reason names into ReasonFlags.
pub fn parse_reason_flags(list: &str) -> CrlResult<ReasonFlags> {
    let mut flags = ReasonFlags::default();
    for name in list.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        let reason: RevocationReason = name.parse().map_err(CrlError::Config)?;
        let flag = reason_flag(reason)
            .ok_or_else(|| CrlError::Config(format!("'{name}' cannot restrict a CRL")))?;
        flags |= flag;
    }
    Ok(flags)
}

fn reason_flag(reason: RevocationReason) -> Option<Reasons> {
    Some(match reason {
        RevocationReason::KeyCompromise => Reasons::KeyCompromise,
        RevocationReason::CaCompromise => Reasons::CaCompromise,
        RevocationReason::AffiliationChanged => Reasons::AffiliationChanged,
        RevocationReason::Superseded => Reasons::Superseded,
        RevocationReason::CessationOfOperation => Reasons::CessationOfOperation,
        RevocationReason::CertificateHold => Reasons::CertificateHold,
        RevocationReason::PrivilegeWithdrawn => Reasons::PrivilegeWithdrawn,
        RevocationReason::AaCompromise => Reasons::AaCompromise,
        RevocationReason::Unspecified | RevocationReason::RemoveFromCrl => return None,
    })
}

/// Extension registry of one issuing point
#[derive(Debug)]
pub struct ExtensionRegistry {
    crl_names: BTreeSet<ExtensionName>,
    entry_names: BTreeSet<ExtensionName>,
    enabled: BTreeSet<ExtensionName>,
    critical: BTreeSet<ExtensionName>,
    generators: BTreeMap<ExtensionName, Box<dyn ExtensionGenerator>>,
    idp_reasons: Option<ReasonFlags>,
    reason_filter: OnceLock<Option<ReasonFlags>>,
}

impl ExtensionRegistry {
    /// Builds the registry. Unknown extension names and invalid settings are
    /// logged; an extension whose settings cannot be used stays disabled.
    pub fn new(
        id: &str,
        overrides: &BTreeMap<String, ExtensionConfig>,
        defaults: &ExtensionDefaults,
        authority_key_id: Option<&[u8]>,
    ) -> Self {
        let mut settings: BTreeMap<ExtensionName, ExtensionSettings> = ExtensionName::ALL
            .into_iter()
            .map(|name| (name, defaults.get(&name).cloned().unwrap_or_default()))
            .collect();
        for (raw_name, config) in overrides {
            match raw_name.parse::<ExtensionName>() {
                Ok(name) => {
                    if let Some(current) = settings.get_mut(&name) {
                        *current = current.overlay(config);
                    }
                }
                Err(e) => warn!("Issuing point {id}: {e}"),
            }
        }

        let mut registry = Self {
            crl_names: BTreeSet::new(),
            entry_names: BTreeSet::new(),
            enabled: BTreeSet::new(),
            critical: BTreeSet::new(),
            generators: BTreeMap::new(),
            idp_reasons: None,
            reason_filter: OnceLock::new(),
        };

        for (name, settings) in settings {
            match name.kind() {
                ExtensionKind::Crl => registry.crl_names.insert(name),
                ExtensionKind::CrlEntry => registry.entry_names.insert(name),
            };
            if settings.critical {
                registry.critical.insert(name);
            }

            match registry.build_generator(name, &settings, authority_key_id) {
                Ok(generator) => {
                    registry.generators.insert(name, generator);
                    if settings.enable {
                        registry.enabled.insert(name);
                    }
                }
                Err(e) => warn!("Issuing point {id}: disabling {name}: {e}"),
            }
        }
        registry
    }

    fn build_generator(
        &mut self,
        name: ExtensionName,
        settings: &ExtensionSettings,
        authority_key_id: Option<&[u8]>,
    ) -> CrlResult<Box<dyn ExtensionGenerator>> {
        Ok(match name {
            ExtensionName::AuthorityKeyIdentifier => {
                Box::new(AuthorityKeyIdentifierGenerator::new(authority_key_id)?)
            }
            ExtensionName::CrlNumber => Box::new(CrlNumberGenerator),
            ExtensionName::DeltaCrlIndicator => Box::new(DeltaCrlIndicatorGenerator),
            ExtensionName::IssuingDistributionPoint => {
                let reasons = settings
                    .only_some_reasons
                    .as_deref()
                    .map(parse_reason_flags)
                    .transpose()?;
                let generator =
                    IssuingDistributionPointGenerator::new(&DistributionPointSettings {
                        point_name: settings.point_name.clone(),
                        only_contains_user_certs: settings.only_contains_user_certs,
                        only_contains_ca_certs: settings.only_contains_ca_certs,
                        only_some_reasons: reasons,
                        indirect_crl: settings.indirect_crl,
                    })?;
                self.idp_reasons = reasons.filter(|flags| !flags.is_empty());
                Box::new(generator)
            }
            ExtensionName::FreshestCrl => {
                Box::new(FreshestCrlGenerator::new(settings.point_name.as_deref())?)
            }
            ExtensionName::CrlReason => Box::new(CrlReasonGenerator),
            ExtensionName::InvalidityDate => Box::new(InvalidityDateGenerator),
        })
    }

    pub fn crl_extension_names(&self) -> impl Iterator<Item = ExtensionName> + '_ {
        self.crl_names.iter().copied()
    }

    pub fn entry_extension_names(&self) -> impl Iterator<Item = ExtensionName> + '_ {
        self.entry_names.iter().copied()
    }

    pub fn is_extension_enabled(&self, name: ExtensionName) -> bool {
        self.enabled.contains(&name)
    }

    pub fn is_critical(&self, name: ExtensionName) -> bool {
        self.critical.contains(&name)
    }

    /// Delta CRLs need the indicator, the number and entry reasons.
    pub fn delta_crl_enabled(&self, allow_extensions: bool) -> bool {
        allow_extensions
            && self.is_extension_enabled(ExtensionName::DeltaCrlIndicator)
            && self.is_extension_enabled(ExtensionName::CrlNumber)
            && self.is_extension_enabled(ExtensionName::CrlReason)
    }

    /// Adds `name` to `set` when enabled. An `existing` extension is reused
    /// with the configured criticality instead of being regenerated.
    pub fn add_to_extensions(
        &self,
        set: &mut Vec<Extension>,
        name: ExtensionName,
        existing: Option<Extension>,
        ctx: &ExtensionContext<'_>,
    ) -> CrlResult<()> {
        if !self.is_extension_enabled(name) {
            return Ok(());
        }
        let critical = self.is_critical(name);
        let extension = match existing {
            Some(mut existing) => {
                existing.critical = critical;
                Some(existing)
            }
            None => match self.generators.get(&name) {
                Some(generator) => generator.generate(ctx, critical)?,
                None => None,
            },
        };
        if let Some(extension) = extension {
            set.push(extension);
        }
        Ok(())
    }

    /// CRL-level extensions of a full (`base_crl_number == None`) or delta CRL.
    pub fn crl_extensions(
        &self,
        crl_number: u64,
        base_crl_number: Option<u64>,
    ) -> CrlResult<Vec<Extension>> {
        let ctx = ExtensionContext::Crl {
            crl_number,
            base_crl_number,
        };
        let delta = base_crl_number.is_some();
        let mut set = Vec::new();
        for name in self.crl_extension_names() {
            let skip = match name {
                ExtensionName::DeltaCrlIndicator => !delta,
                ExtensionName::FreshestCrl => delta,
                _ => false,
            };
            if !skip {
                self.add_to_extensions(&mut set, name, None, &ctx)?;
            }
        }
        Ok(set)
    }

    pub fn entry_extensions(&self, entry: &RevokedEntry) -> CrlResult<Option<Vec<Extension>>> {
        let ctx = ExtensionContext::Entry(entry);
        let mut set = Vec::new();
        for name in self.entry_extension_names() {
            self.add_to_extensions(&mut set, name, None, &ctx)?;
        }
        Ok((!set.is_empty()).then_some(set))
    }

    /// The IssuingDistributionPoint onlySomeReasons set, when the extension is
    /// enabled and restricts reasons. Computed once per registry.
    pub fn only_some_reasons(&self) -> Option<ReasonFlags> {
        *self.reason_filter.get_or_init(|| {
            if self.is_extension_enabled(ExtensionName::IssuingDistributionPoint) {
                self.idp_reasons
            } else {
                None
            }
        })
    }

    /// Entries without a reason, or with `unspecified`, never match a filter.
    pub fn admits_reason(&self, reason: Option<RevocationReason>) -> bool {
        let Some(filter) = self.only_some_reasons() else {
            return true;
        };
        reason
            .and_then(reason_flag)
            .is_some_and(|flag| filter.contains(flag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crl::types::SerialNumber;
    use chrono::Utc;

    fn overrides(pairs: &[(&str, ExtensionConfig)]) -> BTreeMap<String, ExtensionConfig> {
        pairs
            .iter()
            .map(|(name, config)| (name.to_string(), config.clone()))
            .collect()
    }

    fn default_registry() -> ExtensionRegistry {
        ExtensionRegistry::new(
            "MasterCRL",
            &BTreeMap::new(),
            &default_extension_settings(),
            None,
        )
    }

    fn enable() -> ExtensionConfig {
        ExtensionConfig {
            enable: Some(true),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_registry() {
        let registry = default_registry();
        assert!(registry.is_extension_enabled(ExtensionName::CrlNumber));
        assert!(!registry.is_extension_enabled(ExtensionName::DeltaCrlIndicator));
        assert!(registry.is_critical(ExtensionName::IssuingDistributionPoint));
        assert!(!registry.delta_crl_enabled(true));
        assert_eq!(registry.entry_extension_names().count(), 2);
        assert!(registry.admits_reason(None));
    }

    #[test]
    fn test_delta_crl_extensions() {
        let registry = ExtensionRegistry::new(
            "MasterCRL",
            &overrides(&[
                ("DeltaCRLIndicator", enable()),
                (
                    "FreshestCRL",
                    ExtensionConfig {
                        enable: Some(true),
                        point_name: Some("http://crl.example.com/delta.crl".to_string()),
                        ..Default::default()
                    },
                ),
            ]),
            &default_extension_settings(),
            None,
        );
        assert!(registry.delta_crl_enabled(true));
        assert!(!registry.delta_crl_enabled(false));

        let full = registry.crl_extensions(7, None).unwrap();
        let full_ids: Vec<_> = full.iter().map(|e| e.extn_id).collect();
        assert!(full_ids.contains(&generators::CRL_NUMBER));
        assert!(full_ids.contains(&generators::FRESHEST_CRL));
        assert!(!full_ids.contains(&generators::DELTA_CRL_INDICATOR));

        let delta = registry.crl_extensions(8, Some(7)).unwrap();
        let delta_ids: Vec<_> = delta.iter().map(|e| e.extn_id).collect();
        assert!(delta_ids.contains(&generators::DELTA_CRL_INDICATOR));
        assert!(!delta_ids.contains(&generators::FRESHEST_CRL));
    }

    #[test]
    fn test_reason_filter() {
        let registry = ExtensionRegistry::new(
            "MasterCRL",
            &overrides(&[(
                "IssuingDistributionPoint",
                ExtensionConfig {
                    enable: Some(true),
                    only_some_reasons: Some("keyCompromise, cACompromise".to_string()),
                    ..Default::default()
                },
            )]),
            &default_extension_settings(),
            None,
        );
        assert!(registry.admits_reason(Some(RevocationReason::KeyCompromise)));
        assert!(registry.admits_reason(Some(RevocationReason::CaCompromise)));
        assert!(!registry.admits_reason(Some(RevocationReason::Superseded)));
        assert!(!registry.admits_reason(Some(RevocationReason::Unspecified)));
        assert!(!registry.admits_reason(None));
    }

    #[test]
    fn test_invalid_settings_disable_extension() {
        let registry = ExtensionRegistry::new(
            "MasterCRL",
            &overrides(&[
                (
                    "IssuingDistributionPoint",
                    ExtensionConfig {
                        enable: Some(true),
                        only_some_reasons: Some("bogus".to_string()),
                        ..Default::default()
                    },
                ),
                ("NoSuchExtension", enable()),
            ]),
            &default_extension_settings(),
            None,
        );
        assert!(!registry.is_extension_enabled(ExtensionName::IssuingDistributionPoint));
        assert!(registry.admits_reason(Some(RevocationReason::Superseded)));
    }

    #[test]
    fn test_existing_extension_reused() {
        let registry = default_registry();
        let existing = generators::extension(generators::CRL_NUMBER, true, vec![0x02, 0x01, 0x05])
            .unwrap();
        let mut set = Vec::new();
        let ctx = ExtensionContext::Crl {
            crl_number: 9,
            base_crl_number: None,
        };
        registry
            .add_to_extensions(&mut set, ExtensionName::CrlNumber, Some(existing), &ctx)
            .unwrap();
        assert_eq!(set.len(), 1);
        assert!(!set[0].critical);
        assert_eq!(set[0].extn_value.as_bytes(), &[0x02, 0x01, 0x05]);
    }

    #[test]
    fn test_entry_extensions_skip_missing_data() {
        let registry = default_registry();
        let entry = RevokedEntry::new(SerialNumber::from(3u64), Utc::now());
        assert!(registry.entry_extensions(&entry).unwrap().is_none());
        let entry = entry.with_reason(RevocationReason::Superseded);
        assert_eq!(registry.entry_extensions(&entry).unwrap().unwrap().len(), 1);
    }
}
