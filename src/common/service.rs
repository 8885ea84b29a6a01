//! Per-peer tree of sub-services the peer signed in to.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

const SERVER: u8 = 0b01;
const VISITOR: u8 = 0b10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// How a peer takes part in a service sub-network.
pub enum ServiceRole {
    /// Routable member, answers requests inside the sub-network.
    Server,
    /// Uses the sub-network without being advertised as a referral.
    Visitor,
}

impl ServiceRole {
    fn flag(&self) -> u8 {
        match self {
            ServiceRole::Server => SERVER,
            ServiceRole::Visitor => VISITOR,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
/// A node of the service tree, addressed by `/` separated paths like `"chat/room-1"`.
pub struct ServiceDescriptor {
    #[serde(default, rename = "f", skip_serializing_if = "is_zero")]
    flags: u8,
    #[serde(default, rename = "s", skip_serializing_if = "BTreeMap::is_empty")]
    children: BTreeMap<String, ServiceDescriptor>,
}

fn is_zero(flags: &u8) -> bool {
    *flags == 0
}

/// Split a service path, returns None for an empty path.
pub fn split_path(path: &str) -> Option<Vec<&str>> {
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();

    if parts.is_empty() {
        None
    } else {
        Some(parts)
    }
}

impl ServiceDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.flags == 0 && self.children.is_empty()
    }

    /// Sign in to `path` with `role`, creating intermediate nodes.
    ///
    /// Returns false if the path is empty.
    pub fn signin(&mut self, path: &str, role: ServiceRole) -> bool {
        let Some(parts) = split_path(path) else {
            return false;
        };

        let mut node = self;
        for part in parts {
            node = node.children.entry(part.to_string()).or_default();
        }
        node.flags |= role.flag();

        true
    }

    /// Sign out of `path` for `role` (or every role when `None`), pruning
    /// nodes left empty.
    pub fn signout(&mut self, path: &str, role: Option<ServiceRole>) -> bool {
        let Some(parts) = split_path(path) else {
            return false;
        };

        self.signout_parts(&parts, role)
    }

    fn signout_parts(&mut self, parts: &[&str], role: Option<ServiceRole>) -> bool {
        let Some((first, rest)) = parts.split_first() else {
            match role {
                Some(role) => self.flags &= !role.flag(),
                None => {
                    self.flags = 0;
                    self.children.clear();
                }
            }
            return true;
        };

        let Some(child) = self.children.get_mut(*first) else {
            return false;
        };

        let done = child.signout_parts(rest, role);
        if child.is_empty() {
            self.children.remove(*first);
        }

        done
    }

    fn find(&self, path: &str) -> Option<&ServiceDescriptor> {
        let parts = split_path(path)?;

        let mut node = self;
        for part in parts {
            node = node.children.get(part)?;
        }

        Some(node)
    }

    /// True if signed in to `path` as a server.
    pub fn is_server(&self, path: &str) -> bool {
        self.find(path).is_some_and(|n| n.flags & SERVER != 0)
    }

    /// True if signed in to `path` as a visitor.
    pub fn is_visitor(&self, path: &str) -> bool {
        self.find(path).is_some_and(|n| n.flags & VISITOR != 0)
    }

    /// True if signed in to `path` with any role.
    pub fn has(&self, path: &str) -> bool {
        self.find(path).is_some_and(|n| n.flags != 0)
    }

    /// Every signed in path, depth first.
    pub fn paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        self.collect_paths("", &mut paths);
        paths
    }

    fn collect_paths(&self, prefix: &str, paths: &mut Vec<String>) {
        for (name, child) in &self.children {
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}/{name}")
            };

            if child.flags != 0 {
                paths.push(path.clone());
            }
            child.collect_paths(&path, paths);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn signin_and_signout() {
        let mut services = ServiceDescriptor::new();

        assert!(services.signin("chat/room-1", ServiceRole::Server));
        assert!(services.signin("chat", ServiceRole::Visitor));

        assert!(services.is_server("chat/room-1"));
        assert!(!services.is_visitor("chat/room-1"));
        assert!(services.is_visitor("chat"));
        assert!(!services.is_server("chat"));
        assert!(services.has("/chat//room-1/"));

        assert_eq!(services.paths(), vec!["chat", "chat/room-1"]);

        assert!(services.signout("chat/room-1", Some(ServiceRole::Server)));
        assert!(!services.has("chat/room-1"));
        assert!(services.has("chat"));

        assert!(services.signout("chat", None));
        assert!(services.is_empty());
    }

    #[test]
    fn empty_path() {
        let mut services = ServiceDescriptor::new();

        assert!(!services.signin("", ServiceRole::Server));
        assert!(!services.signin("///", ServiceRole::Server));
        assert!(!services.has(""));
    }

    #[test]
    fn bencode_round_trip() {
        let mut services = ServiceDescriptor::new();
        services.signin("a/b", ServiceRole::Server);
        services.signin("c", ServiceRole::Visitor);

        let bytes = serde_bencode::to_bytes(&services).unwrap();
        let decoded: ServiceDescriptor = serde_bencode::from_bytes(&bytes).unwrap();

        assert_eq!(decoded, services);
    }
}
