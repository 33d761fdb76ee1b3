//! Target account and region of a stack.

use crate::intrinsic;
use serde_json::Value;

/// Environment variable holding the target account.
pub const ACCOUNT_VAR: &str = "CDK_DEFAULT_ACCOUNT";

/// Environment variable holding the target region.
pub const REGION_VAR: &str = "CDK_DEFAULT_REGION";

/// Account and region a stack is bound to.
///
/// Built once at process start. When either value is missing the stack is environment-agnostic:
/// region-specific lookups are deferred to the provisioning engine and a single template can be
/// deployed anywhere.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Environment {
    pub account: Option<String>,
    pub region: Option<String>,
}

impl Environment {
    /// An environment-agnostic target.
    pub fn agnostic() -> Self {
        Self::default()
    }

    /// Read [ACCOUNT_VAR] and [REGION_VAR] from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        Self {
            account: read(ACCOUNT_VAR),
            region: read(REGION_VAR),
        }
    }

    /// Returns true if the stack is not bound to a concrete account and region.
    pub fn is_agnostic(&self) -> bool {
        self.account.is_none() || self.region.is_none()
    }

    /// Returns `count` availability zones, picked from `Fn::GetAZs` when the template is applied.
    ///
    /// A bound stack looks up the zones of its own region. Zone names are never guessed, since
    /// regions do not share a naming pattern.
    pub fn availability_zones(&self, count: usize) -> Vec<Value> {
        let region = match (&self.account, &self.region) {
            (Some(_), Some(region)) => region.as_str(),
            _ => "",
        };
        (0..count)
            .map(|i| intrinsic::select(i, intrinsic::get_azs(region)))
            .collect()
    }
}
