//! Owner/repository allow and deny lists.

pub mod compile;
pub mod matcher;
pub mod model;

use crate::github::Identity;

use self::model::RuleList;

/// Which list turned a request away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    WhiteList,
    BlackList,
}

impl Rejection {
    pub fn message(self) -> &'static str {
        match self {
            Rejection::WhiteList => "Forbidden by white list.",
            Rejection::BlackList => "Forbidden by black list.",
        }
    }

    pub fn list_name(self) -> &'static str {
        match self {
            Rejection::WhiteList => "white",
            Rejection::BlackList => "black",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Rejected(Rejection),
    /// `pass` marks identities on the pass list, which are redirected instead of proxied.
    Allowed { pass: bool },
}

/// The three rule lists, evaluated white, then black, then pass.
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    white: RuleList,
    black: RuleList,
    pass: RuleList,
}

impl AccessPolicy {
    pub fn new(white: RuleList, black: RuleList, pass: RuleList) -> Self {
        Self { white, black, pass }
    }

    pub fn white(&self) -> &RuleList {
        &self.white
    }

    pub fn black(&self) -> &RuleList {
        &self.black
    }

    pub fn pass(&self) -> &RuleList {
        &self.pass
    }

    /// An empty white list admits everyone; the black list always applies.
    pub fn evaluate(&self, identity: &Identity) -> Verdict {
        let components = identity.components();
        if !self.white.is_empty() && !self.white.matches(&components) {
            return Verdict::Rejected(Rejection::WhiteList);
        }
        if self.black.matches(&components) {
            return Verdict::Rejected(Rejection::BlackList);
        }
        Verdict::Allowed {
            pass: self.pass.matches(&components),
        }
    }
}
