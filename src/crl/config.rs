use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{Duration, FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::errors::{CrlError, CrlResult};
use super::schedule::{DailySchedule, Schedule};
use super::types::SerialNumber;
use crate::signer::SigningAlgorithm;
use crate::store::SerialRange;

/// Per-issuing-point configuration.
///
/// Durations are expressed in minutes unless the field name says otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IssuingPointConfig {
    pub enable: bool,
    pub description: String,
    pub enable_crl_updates: bool,
    pub enable_update_interval: bool,
    pub auto_update_interval: u64,
    pub enable_daily_updates: bool,
    pub daily_updates: String,
    pub min_update_interval: u64,
    pub update_schema: u32,
    pub extended_next_update: bool,
    pub next_update_grace_period: u64,
    pub next_as_this_update_extension: u64,
    pub utc_offset_minutes: i32,
    pub enable_crl_cache: bool,
    /// Zero makes the cache write-through.
    pub cache_update_interval: u64,
    pub enable_cache_recovery: bool,
    pub signing_algorithm: String,
    pub include_expired_certs: bool,
    pub include_expired_certs_one_extra_time: bool,
    pub ca_certs_only: bool,
    pub profile_certs_only: bool,
    pub profile_list: String,
    pub begin_serial_number: Option<String>,
    pub end_serial_number: Option<String>,
    pub save_memory: bool,
    pub no_crl_if_no_revoked_cert: bool,
    pub publish_on_start: bool,
    pub allow_extensions: bool,
    pub page_size: usize,
    pub unexpected_exception_wait_time_secs: u64,
    pub unexpected_exception_loop_max: u32,
    pub extensions: BTreeMap<String, ExtensionConfig>,
}

impl Default for IssuingPointConfig {
    fn default() -> Self {
        Self {
            enable: true,
            description: String::new(),
            enable_crl_updates: true,
            enable_update_interval: true,
            auto_update_interval: 240,
            enable_daily_updates: false,
            daily_updates: "1:00".to_string(),
            min_update_interval: 0,
            update_schema: 1,
            extended_next_update: true,
            next_update_grace_period: 0,
            next_as_this_update_extension: 0,
            utc_offset_minutes: 0,
            enable_crl_cache: true,
            cache_update_interval: 15,
            enable_cache_recovery: true,
            signing_algorithm: SigningAlgorithm::default().name().to_string(),
            include_expired_certs: false,
            include_expired_certs_one_extra_time: false,
            ca_certs_only: false,
            profile_certs_only: false,
            profile_list: String::new(),
            begin_serial_number: None,
            end_serial_number: None,
            save_memory: false,
            no_crl_if_no_revoked_cert: false,
            publish_on_start: false,
            allow_extensions: true,
            page_size: 1000,
            unexpected_exception_wait_time_secs: 30,
            unexpected_exception_loop_max: 10,
            extensions: BTreeMap::new(),
        }
    }
}

/// Per-issuing-point override of a CRL extension's settings.
///
/// Unset fields keep the CA-wide default for that extension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtensionConfig {
    pub enable: Option<bool>,
    pub critical: Option<bool>,
    pub point_name: Option<String>,
    pub only_contains_user_certs: Option<bool>,
    pub only_contains_ca_certs: Option<bool>,
    pub only_some_reasons: Option<String>,
    pub indirect_crl: Option<bool>,
}

/// Which derived parts of an issuing point a configuration change touches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigChanges {
    pub enable: bool,
    pub schedule: bool,
    pub update_interval_disabled: bool,
    pub cache_enable: bool,
    pub cache_contents: bool,
    pub extensions: bool,
}

impl ConfigChanges {
    pub fn between(old: &IssuingPointConfig, new: &IssuingPointConfig) -> Self {
        Self {
            enable: old.enable != new.enable,
            schedule: old.enable_crl_updates != new.enable_crl_updates
                || old.enable_update_interval != new.enable_update_interval
                || old.auto_update_interval != new.auto_update_interval
                || old.enable_daily_updates != new.enable_daily_updates
                || old.daily_updates != new.daily_updates
                || old.min_update_interval != new.min_update_interval
                || old.update_schema != new.update_schema
                || old.extended_next_update != new.extended_next_update
                || old.utc_offset_minutes != new.utc_offset_minutes,
            update_interval_disabled: old.enable_update_interval && !new.enable_update_interval,
            cache_enable: old.enable_crl_cache != new.enable_crl_cache,
            cache_contents: old.include_expired_certs != new.include_expired_certs
                || old.ca_certs_only != new.ca_certs_only
                || old.profile_certs_only != new.profile_certs_only
                || old.profile_list != new.profile_list
                || old.begin_serial_number != new.begin_serial_number
                || old.end_serial_number != new.end_serial_number,
            extensions: old.extensions != new.extensions || old.allow_extensions != new.allow_extensions,
        }
    }
}

impl IssuingPointConfig {
    /// Applies one `name = value` pair from an operator update.
    ///
    /// Names are accepted in snake_case or camelCase; extension settings use
    /// `extensions.<ExtensionName>.<setting>`. A malformed value is logged and
    /// the setting falls back to its default.
    pub fn apply(&mut self, name: &str, value: &str) -> CrlResult<()> {
        if let Some(rest) = name.strip_prefix("extensions.") {
            return self.apply_extension(rest, value);
        }

        let defaults = Self::default();
        let key = to_snake_case(name.trim());
        let value = value.trim();
        match key.as_str() {
            "enable" => self.enable = parse_or(&key, value, defaults.enable),
            "description" => self.description = value.to_string(),
            "enable_crl_updates" => {
                self.enable_crl_updates = parse_or(&key, value, defaults.enable_crl_updates)
            }
            "enable_update_interval" => {
                self.enable_update_interval =
                    parse_or(&key, value, defaults.enable_update_interval)
            }
            "auto_update_interval" => {
                self.auto_update_interval = parse_or(&key, value, defaults.auto_update_interval)
            }
            "enable_daily_updates" => {
                self.enable_daily_updates = parse_or(&key, value, defaults.enable_daily_updates)
            }
            "daily_updates" => self.daily_updates = value.to_string(),
            "min_update_interval" => {
                self.min_update_interval = parse_or(&key, value, defaults.min_update_interval)
            }
            "update_schema" => {
                self.update_schema = parse_or(&key, value, defaults.update_schema).max(1)
            }
            "extended_next_update" => {
                self.extended_next_update = parse_or(&key, value, defaults.extended_next_update)
            }
            "next_update_grace_period" => {
                self.next_update_grace_period =
                    parse_or(&key, value, defaults.next_update_grace_period)
            }
            "next_as_this_update_extension" => {
                self.next_as_this_update_extension =
                    parse_or(&key, value, defaults.next_as_this_update_extension)
            }
            "utc_offset_minutes" => {
                self.utc_offset_minutes = parse_or(&key, value, defaults.utc_offset_minutes)
            }
            "enable_crl_cache" => {
                self.enable_crl_cache = parse_or(&key, value, defaults.enable_crl_cache)
            }
            "cache_update_interval" => {
                self.cache_update_interval = parse_or(&key, value, defaults.cache_update_interval)
            }
            "enable_cache_recovery" => {
                self.enable_cache_recovery = parse_or(&key, value, defaults.enable_cache_recovery)
            }
            "signing_algorithm" => {
                self.signing_algorithm = match value.parse::<SigningAlgorithm>() {
                    Ok(algorithm) => algorithm.name().to_string(),
                    Err(e) => {
                        warn!("{e}, using {}", defaults.signing_algorithm);
                        defaults.signing_algorithm
                    }
                }
            }
            "include_expired_certs" => {
                self.include_expired_certs = parse_or(&key, value, defaults.include_expired_certs)
            }
            "include_expired_certs_one_extra_time" => {
                self.include_expired_certs_one_extra_time =
                    parse_or(&key, value, defaults.include_expired_certs_one_extra_time)
            }
            "ca_certs_only" => self.ca_certs_only = parse_or(&key, value, defaults.ca_certs_only),
            "profile_certs_only" => {
                self.profile_certs_only = parse_or(&key, value, defaults.profile_certs_only)
            }
            "profile_list" => self.profile_list = value.to_string(),
            "begin_serial_number" => self.begin_serial_number = non_empty(value),
            "end_serial_number" => self.end_serial_number = non_empty(value),
            "save_memory" => self.save_memory = parse_or(&key, value, defaults.save_memory),
            "no_crl_if_no_revoked_cert" => {
                self.no_crl_if_no_revoked_cert =
                    parse_or(&key, value, defaults.no_crl_if_no_revoked_cert)
            }
            "publish_on_start" => {
                self.publish_on_start = parse_or(&key, value, defaults.publish_on_start)
            }
            "allow_extensions" => {
                self.allow_extensions = parse_or(&key, value, defaults.allow_extensions)
            }
            "page_size" => self.page_size = parse_or(&key, value, defaults.page_size).max(1),
            "unexpected_exception_wait_time_secs" | "unexpected_exception_wait_time" => {
                self.unexpected_exception_wait_time_secs =
                    parse_or(&key, value, defaults.unexpected_exception_wait_time_secs)
            }
            "unexpected_exception_loop_max" => {
                self.unexpected_exception_loop_max =
                    parse_or(&key, value, defaults.unexpected_exception_loop_max)
            }
            _ => return Err(CrlError::Config(format!("unknown setting '{name}'"))),
        }
        Ok(())
    }

    fn apply_extension(&mut self, key: &str, value: &str) -> CrlResult<()> {
        let (extension, setting) = key
            .split_once('.')
            .ok_or_else(|| CrlError::Config(format!("malformed extension setting '{key}'")))?;
        let setting = to_snake_case(setting);
        let entry = self.extensions.entry(extension.to_string()).or_default();
        let value = value.trim();
        match setting.as_str() {
            "enable" => entry.enable = parse_opt(&setting, value),
            "critical" => entry.critical = parse_opt(&setting, value),
            "point_name" => entry.point_name = non_empty(value),
            "only_contains_user_certs" => entry.only_contains_user_certs = parse_opt(&setting, value),
            "only_contains_ca_certs" => entry.only_contains_ca_certs = parse_opt(&setting, value),
            "only_some_reasons" => entry.only_some_reasons = non_empty(value),
            "indirect_crl" => entry.indirect_crl = parse_opt(&setting, value),
            _ => {
                return Err(CrlError::Config(format!(
                    "unknown setting '{setting}' for extension {extension}"
                )));
            }
        }
        Ok(())
    }

    pub fn cache_enabled(&self) -> bool {
        self.enable_crl_cache
    }

    pub fn write_through(&self) -> bool {
        self.cache_update_interval == 0
    }

    pub fn cache_update_interval(&self) -> Duration {
        self.minutes("cache_update_interval", self.cache_update_interval, |d| {
            d.cache_update_interval
        })
    }

    /// Converts a minute setting, falling back to the default when it is out of range.
    fn minutes(&self, field: &str, value: u64, default: fn(&Self) -> u64) -> Duration {
        let to_duration = |minutes: u64| {
            i64::try_from(minutes)
                .ok()
                .and_then(Duration::try_minutes)
        };
        to_duration(value).unwrap_or_else(|| {
            let fallback = default(&Self::default());
            warn!("{field} of {value} minutes is out of range, using {fallback}");
            to_duration(fallback).unwrap_or_else(Duration::zero)
        })
    }

    pub fn retry_wait(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.unexpected_exception_wait_time_secs)
    }

    /// Derives the update schedule. An unparsable daily list disables daily updates.
    pub fn schedule(&self, id: &str) -> Schedule {
        let mut schedule = Schedule {
            min_update_interval: self.minutes(
                "min_update_interval",
                self.min_update_interval,
                |d| d.min_update_interval,
            ),
            update_schema: self.update_schema.max(1),
            extended_next_update: self.extended_next_update,
            grace_period: self.minutes(
                "next_update_grace_period",
                self.next_update_grace_period,
                |d| d.next_update_grace_period,
            ),
            next_as_this_update_extension: self.minutes(
                "next_as_this_update_extension",
                self.next_as_this_update_extension,
                |d| d.next_as_this_update_extension,
            ),
            utc_offset: FixedOffset::east_opt(self.utc_offset_minutes.saturating_mul(60))
                .unwrap_or_else(|| {
                    warn!(
                        "Issuing point {id}: invalid UTC offset {} minutes, using UTC",
                        self.utc_offset_minutes
                    );
                    Utc.fix()
                }),
            ..Schedule::default()
        };

        if !self.enable_crl_updates {
            return schedule;
        }
        if self.enable_update_interval && self.auto_update_interval > 0 {
            schedule.interval = Some(self.minutes(
                "auto_update_interval",
                self.auto_update_interval,
                |d| d.auto_update_interval,
            ));
        }
        if self.enable_daily_updates {
            match self.daily_updates.parse::<DailySchedule>() {
                Ok(daily) => schedule.daily = Some(daily),
                Err(e) => warn!("Issuing point {id}: daily updates disabled: {e}"),
            }
        }
        schedule
    }

    pub fn algorithm(&self, id: &str) -> SigningAlgorithm {
        self.signing_algorithm.parse().unwrap_or_else(|e| {
            warn!("Issuing point {id}: {e}, using default");
            SigningAlgorithm::default()
        })
    }

    pub fn serial_range(&self, id: &str) -> SerialRange {
        let parse = |bound: &Option<String>, label: &str| {
            bound.as_deref().and_then(|raw| {
                SerialNumber::from_str(raw)
                    .inspect_err(|e| warn!("Issuing point {id}: ignoring {label} serial: {e}"))
                    .ok()
            })
        };
        SerialRange {
            begin: parse(&self.begin_serial_number, "begin"),
            end: parse(&self.end_serial_number, "end"),
        }
    }

    /// Profile ids this point is restricted to, when profile filtering is on.
    pub fn profiles(&self) -> Option<Vec<String>> {
        if !self.profile_certs_only {
            return None;
        }
        Some(
            self.profile_list
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }
}


fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

trait ConfigValue: Sized {
    fn parse_value(raw: &str) -> Option<Self>;
}

impl ConfigValue for bool {
    fn parse_value(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Some(true),
            "false" | "no" | "0" => Some(false),
            _ => None,
        }
    }
}

macro_rules! numeric_config_value {
    ($($ty:ty),*) => {
        $(impl ConfigValue for $ty {
            fn parse_value(raw: &str) -> Option<Self> {
                raw.parse().ok()
            }
        })*
    };
}

numeric_config_value!(u32, u64, i32, usize);

fn parse_or<T: ConfigValue>(key: &str, raw: &str, default: T) -> T {
    T::parse_value(raw).unwrap_or_else(|| {
        warn!("Invalid value '{raw}' for {key}, using default");
        default
    })
}

fn parse_opt<T: ConfigValue>(key: &str, raw: &str) -> Option<T> {
    let parsed = T::parse_value(raw);
    if parsed.is_none() {
        warn!("Invalid value '{raw}' for {key}, using default");
    }
    parsed
}

fn to_snake_case(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);
    for (i, c) in chars.iter().enumerate() {
        if c.is_ascii_uppercase() && i > 0 {
            let prev = chars[i - 1];
            let next_lower = chars.get(i + 1).is_some_and(|n| n.is_ascii_lowercase());
            if prev.is_ascii_lowercase()
                || prev.is_ascii_digit()
                || (prev.is_ascii_uppercase() && next_lower)
            {
                out.push('_');
            }
        }
        out.push(c.to_ascii_lowercase());
    }
    out
}
