//! Deployment settings.
//!
//! Settings come from an optional KDL file and are overridden by
//! environment variables. Every field has a documented default except the
//! domain, which the pipeline unit cannot be declared without.
//!
//! ```kdl
//! app "Wordpress"
//! network cidr="10.0.0.0/16" max-azs=3
//! repositories source="Wordpress" image="wordpress" branch="master"
//! domain "example.com" subdomain="blog"
//! account id="123456789012" region="us-east-1"
//! ```

use crate::node::{first_string_arg, int_prop, string_prop};
use crate::{ConfigError, ConfigResult};
use kdl::KdlDocument;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable holding the mandatory domain.
pub const DOMAIN_ENV: &str = "domainName";
/// Environment variable holding the optional subdomain.
pub const SUBDOMAIN_ENV: &str = "subDomainName";
pub const ACCOUNT_ENV: &str = "WPSTACK_ACCOUNT_ID";
pub const REGION_ENV: &str = "WPSTACK_REGION";
pub const APP_NAME_ENV: &str = "WPSTACK_APP_NAME";

pub const DEFAULT_APP_NAME: &str = "Wordpress";
pub const DEFAULT_CIDR: &str = "10.0.0.0/16";
pub const DEFAULT_MAX_AZS: u32 = 3;
/// Upper bound on availability zones per VPC.
pub const MAX_AZS: u32 = 6;
pub const DEFAULT_SOURCE_REPOSITORY: &str = "Wordpress";
pub const DEFAULT_IMAGE_REPOSITORY: &str = "wordpress";
pub const DEFAULT_BRANCH: &str = "master";
pub const DEFAULT_SUBDOMAIN: &str = "wordpress";

/// Settings as read from a file and the environment, before defaults and
/// validation are applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialSettings {
    pub app_name: Option<String>,
    pub cidr: Option<String>,
    pub max_azs: Option<u32>,
    pub source_repository: Option<String>,
    pub image_repository: Option<String>,
    pub branch: Option<String>,
    pub domain_name: Option<String>,
    pub sub_domain_name: Option<String>,
    pub account_id: Option<String>,
    pub region: Option<String>,
}

/// Settings of the base unit: the two long-lived repositories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseSettings {
    pub source_repository: String,
    pub image_repository: String,
}

/// Validated settings of the pipeline unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentSettings {
    /// Prefix for named resources (log group, roles, pipeline).
    pub app_name: String,
    pub cidr: String,
    pub max_azs: u32,
    /// Source repository declared by the base unit, referenced by name.
    pub source_repository: String,
    /// Image repository declared by the base unit, referenced by name.
    pub image_repository: String,
    /// Branch the source action follows.
    pub branch: String,
    pub domain_name: String,
    pub sub_domain_name: String,
    pub account_id: Option<String>,
    pub region: Option<String>,
}

impl DeploymentSettings {
    /// Host name routed to the service, `<subdomain>.<domain>`.
    pub fn service_domain(&self) -> String {
        format!("{}.{}", self.sub_domain_name, self.domain_name)
    }

    /// Wildcard certificate name, `*.<domain>`.
    pub fn certificate_domain(&self) -> String {
        format!("*.{}", self.domain_name)
    }

    pub fn base(&self) -> BaseSettings {
        BaseSettings {
            source_repository: self.source_repository.clone(),
            image_repository: self.image_repository.clone(),
        }
    }
}

/// Parse a settings document from KDL text.
pub fn parse_settings(kdl: &str) -> ConfigResult<PartialSettings> {
    let doc: KdlDocument = kdl.parse()?;
    let mut settings = PartialSettings::default();

    for node in doc.nodes() {
        match node.name().value() {
            "app" => {
                settings.app_name = first_string_arg(node);
            }
            "network" => {
                settings.cidr = string_prop(node, "cidr");
                if let Some(azs) = int_prop(node, "max-azs") {
                    let azs = u32::try_from(azs)
                        .map_err(|_| ConfigError::invalid("network max-azs", "out of range"))?;
                    settings.max_azs = Some(azs);
                }
            }
            "repositories" => {
                settings.source_repository = string_prop(node, "source");
                settings.image_repository = string_prop(node, "image");
                settings.branch = string_prop(node, "branch");
            }
            "domain" => {
                settings.domain_name = first_string_arg(node);
                settings.sub_domain_name = string_prop(node, "subdomain");
            }
            "account" => {
                settings.account_id = string_prop(node, "id");
                settings.region = string_prop(node, "region");
            }
            _ => {} // Ignore unknown nodes
        }
    }

    Ok(settings)
}

/// Load settings from an optional file and the process environment.
pub fn load_settings(path: Option<&Path>) -> ConfigResult<PartialSettings> {
    let file = match path {
        Some(path) => parse_settings(&std::fs::read_to_string(path)?)?,
        None => PartialSettings::default(),
    };
    Ok(file.with_overrides(|key| std::env::var(key).ok()))
}

impl PartialSettings {
    /// Apply overrides from a key lookup (normally the process environment).
    /// Empty values count as unset.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get(DOMAIN_ENV) {
            self.domain_name = Some(v);
        }
        if let Some(v) = get(SUBDOMAIN_ENV) {
            self.sub_domain_name = Some(v);
        }
        if let Some(v) = get(ACCOUNT_ENV) {
            self.account_id = Some(v);
        }
        if let Some(v) = get(REGION_ENV) {
            self.region = Some(v);
        }
        if let Some(v) = get(APP_NAME_ENV) {
            self.app_name = Some(v);
        }
        self
    }

    /// Resolve the settings the base unit needs. Never requires a domain.
    pub fn resolve_base(&self) -> ConfigResult<BaseSettings> {
        Ok(BaseSettings {
            source_repository: non_empty(
                "repositories source",
                self.source_repository.as_deref(),
                DEFAULT_SOURCE_REPOSITORY,
            )?,
            image_repository: non_empty(
                "repositories image",
                self.image_repository.as_deref(),
                DEFAULT_IMAGE_REPOSITORY,
            )?,
        })
    }

    /// Apply defaults and validate. Fails with [`ConfigError::MissingDomain`]
    /// before anything else is checked when no domain is configured.
    pub fn resolve(&self) -> ConfigResult<DeploymentSettings> {
        let domain_name = match self.domain_name.as_deref().map(str::trim) {
            None | Some("") => return Err(ConfigError::MissingDomain),
            Some(domain) => validate_domain("domain", domain)?,
        };

        let sub_domain_name = match self.sub_domain_name.as_deref().map(str::trim) {
            None | Some("") => DEFAULT_SUBDOMAIN.to_string(),
            Some(sub) => validate_labels("domain subdomain", sub)?,
        };

        let cidr = self.cidr.as_deref().unwrap_or(DEFAULT_CIDR).trim().to_string();
        validate_cidr(&cidr)?;

        let max_azs = self.max_azs.unwrap_or(DEFAULT_MAX_AZS);
        if max_azs == 0 {
            return Err(ConfigError::invalid(
                "network max-azs",
                "at least one availability zone is required",
            ));
        }
        if max_azs > MAX_AZS {
            return Err(ConfigError::invalid(
                "network max-azs",
                format!("{} exceeds the limit of {} availability zones", max_azs, MAX_AZS),
            ));
        }

        let base = self.resolve_base()?;

        Ok(DeploymentSettings {
            app_name: non_empty("app", self.app_name.as_deref(), DEFAULT_APP_NAME)?,
            cidr,
            max_azs,
            source_repository: base.source_repository,
            image_repository: base.image_repository,
            branch: non_empty("repositories branch", self.branch.as_deref(), DEFAULT_BRANCH)?,
            domain_name,
            sub_domain_name,
            account_id: self.account_id.clone(),
            region: self.region.clone(),
        })
    }
}

fn non_empty(field: &str, value: Option<&str>, default: &str) -> ConfigResult<String> {
    match value.map(str::trim) {
        None => Ok(default.to_string()),
        Some("") => Err(ConfigError::invalid(field, "must not be empty")),
        Some(v) => Ok(v.to_string()),
    }
}

fn validate_label(field: &str, label: &str) -> ConfigResult<String> {
    let valid = !label.is_empty()
        && label.len() <= 63
        && !label.starts_with('-')
        && !label.ends_with('-')
        && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
    if !valid {
        return Err(ConfigError::invalid(
            field,
            format!("'{}' is not a valid DNS label", label),
        ));
    }
    Ok(label.to_ascii_lowercase())
}

fn validate_domain(field: &str, domain: &str) -> ConfigResult<String> {
    let domain = domain.trim_end_matches('.');
    if !domain.contains('.') {
        return Err(ConfigError::invalid(
            field,
            format!("'{}' is not a fully qualified domain name", domain),
        ));
    }
    validate_labels(field, domain)
}

fn validate_labels(field: &str, name: &str) -> ConfigResult<String> {
    let labels = name
        .split('.')
        .map(|label| validate_label(field, label))
        .collect::<ConfigResult<Vec<_>>>()?;
    Ok(labels.join("."))
}

fn validate_cidr(cidr: &str) -> ConfigResult<()> {
    let invalid = || {
        ConfigError::invalid(
            "network cidr",
            format!("'{}' is not an IPv4 CIDR block", cidr),
        )
    };
    let (addr, prefix) = cidr.split_once('/').ok_or_else(invalid)?;
    addr.parse::<std::net::Ipv4Addr>().map_err(|_| invalid())?;
    let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
    if !(16..=28).contains(&prefix) {
        return Err(ConfigError::invalid(
            "network cidr",
            format!("prefix /{} outside the allowed /16../28 range", prefix),
        ));
    }
    Ok(())
}
