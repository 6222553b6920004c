use crate::github::{
    Classification, Classifier, ResourceKind, fix_url,
    rewrite::{blob_to_raw, to_mirror},
};
use crate::policy::{AccessPolicy, Rejection, Verdict};

/// Why a proxied path was turned away with 403.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    InvalidInput,
    Policy(Rejection),
}

impl Refusal {
    pub fn message(self) -> &'static str {
        match self {
            Refusal::InvalidInput => "Invalid input.",
            Refusal::Policy(rejection) => rejection.message(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    Refuse(Refusal),
    /// 302 to the jsDelivr mirror.
    Mirror { location: String },
    /// 302 straight to GitHub for pass-listed repositories.
    Pass { location: String },
    /// Fetch `target` and stream it back.
    Forward { target: String },
}

impl Plan {
    pub fn decision(&self) -> &'static str {
        match self {
            Plan::Refuse(Refusal::InvalidInput) => "INVALID",
            Plan::Refuse(Refusal::Policy(_)) => "DENY",
            Plan::Mirror { .. } => "MIRROR",
            Plan::Pass { .. } => "PASS",
            Plan::Forward { .. } => "FORWARD",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedRequest {
    pub plan: Plan,
    pub classification: Option<Classification>,
}

/// Decides what to do with a proxied path.
///
/// `raw_path` is the request path without its leading slash and `query` the raw query string.
/// Steps run in a fixed order: normalize, classify, white list, black list, mirror redirect,
/// blob-to-raw rewrite, pass redirect, forward.
pub fn plan_request(
    raw_path: &str,
    query: Option<&str>,
    policy: &AccessPolicy,
    mirror_enabled: bool,
) -> PlannedRequest {
    let classifier = Classifier::github();
    let path = fix_url(raw_path);

    let Some(classification) = classifier.classify(&path) else {
        return PlannedRequest {
            plan: Plan::Refuse(Refusal::InvalidInput),
            classification: None,
        };
    };

    let pass = match policy.evaluate(&classification.identity) {
        Verdict::Rejected(rejection) => {
            return PlannedRequest {
                plan: Plan::Refuse(Refusal::Policy(rejection)),
                classification: Some(classification),
            };
        }
        Verdict::Allowed { pass } => pass,
    };

    let mirrorable = classifier.matches_kind(ResourceKind::Blob, &path)
        || classifier.matches_kind(ResourceKind::RawContent, &path);
    if (mirror_enabled || pass)
        && mirrorable
        && let Some(location) = to_mirror(&path)
    {
        return PlannedRequest {
            plan: Plan::Mirror { location },
            classification: Some(classification),
        };
    }

    let path = blob_to_raw(&path);
    let target = match query.filter(|query| !query.is_empty()) {
        Some(query) => fix_url(&format!("{path}?{query}")),
        None => fix_url(&path),
    };

    let plan = if pass {
        Plan::Pass { location: target }
    } else {
        Plan::Forward { target }
    };
    PlannedRequest {
        plan,
        classification: Some(classification),
    }
}
