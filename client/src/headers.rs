//! Header sanitization for forwarded requests
//!
//! Connection-management headers describe the hop they arrived on and
//! must not be replayed onto a new connection. Both the tunnel forwarder
//! and the capture relay strip them; each adds its own rules on top.

/// Headers that are never copied onto a forwarded request
pub const HOP_BY_HOP: &[&str] = &["host", "connection", "content-length", "transfer-encoding"];

/// Header rewrite rule
#[derive(Debug, Clone)]
pub enum HeaderRule {
    /// Set header (overwrites existing)
    Set(String, String),
    /// Remove header by name
    Remove(String),
}

/// Ordered set of header rules, matched case-insensitively
#[derive(Debug, Clone, Default)]
pub struct HeaderRewriter {
    pub rules: Vec<HeaderRule>,
}

impl HeaderRewriter {
    /// Rules for replaying a tunnel request against the local service.
    /// The local client negotiates its own `accept-encoding` and decodes
    /// the reply, so the caller's is dropped.
    pub fn forwarding(host: &str) -> Self {
        let mut rules = hop_by_hop_rules();
        rules.push(HeaderRule::Remove("accept-encoding".into()));
        rules.push(HeaderRule::Set("host".into(), host.to_string()));
        Self { rules }
    }

    /// Rules for relaying a captured request to the sink. The content type
    /// is chosen by the relay, so the caller's is always dropped.
    pub fn capture(user_agent: &str) -> Self {
        let mut rules = hop_by_hop_rules();
        rules.push(HeaderRule::Remove("content-type".into()));
        rules.push(HeaderRule::Set("user-agent".into(), user_agent.to_string()));
        Self { rules }
    }

    pub fn apply(&self, headers: &mut Vec<(String, String)>) {
        for rule in &self.rules {
            match rule {
                HeaderRule::Set(k, v) => upsert(headers, k, v),
                HeaderRule::Remove(k) => headers.retain(|(name, _)| !name.eq_ignore_ascii_case(k)),
            }
        }
    }

    pub fn rewrite<I>(&self, headers: I) -> Vec<(String, String)>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut out: Vec<(String, String)> = headers.into_iter().collect();
        self.apply(&mut out);
        out
    }
}

fn hop_by_hop_rules() -> Vec<HeaderRule> {
    HOP_BY_HOP
        .iter()
        .map(|name| HeaderRule::Remove(name.to_string()))
        .collect()
}

/// Insert or update a header
fn upsert(headers: &mut Vec<(String, String)>, key: &str, value: &str) {
    if let Some(h) = headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(key)) {
        h.1 = value.to_string();
    } else {
        headers.push((key.to_string(), value.to_string()));
    }
}
