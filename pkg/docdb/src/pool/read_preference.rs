//! Read-preference filtering: which server roles and tags
//! a message is allowed to land on.

use crate::bson::Document;
use crate::server::{Role, Server};

#[derive(Debug, Clone)]
pub enum ReadPreference {
    Primary,
    PrimaryPreferred { tags: Option<Document> },
    Secondary { tags: Option<Document> },
    SecondaryPreferred { tags: Option<Document> },
    Nearest { tags: Option<Document> },
}

impl ReadPreference {
    pub fn is_eligible(&self, server: &Server) -> bool {
        let role = server.role();
        match self {
            ReadPreference::Primary => role == Role::Writable,
            ReadPreference::PrimaryPreferred { tags } => {
                role == Role::Writable || (role == Role::ReadOnly && tags_match(tags, &server.tags()))
            }
            ReadPreference::Secondary { tags } => {
                role == Role::ReadOnly && tags_match(tags, &server.tags())
            }
            ReadPreference::SecondaryPreferred { tags } => {
                (role == Role::ReadOnly && tags_match(tags, &server.tags())) || role == Role::Writable
            }
            ReadPreference::Nearest { tags } => {
                (role == Role::Writable || role == Role::ReadOnly) && tags_match(tags, &server.tags())
            }
        }
    }

    /// Whether, among otherwise-eligible connections, this preference
    /// should break ties by lowest latency (only `nearest` does).
    pub fn prefers_lowest_latency(&self) -> bool {
        matches!(self, ReadPreference::Nearest { .. })
    }
}

fn tags_match(wanted: &Option<Document>, actual: &Option<Document>) -> bool {
    let Some(wanted) = wanted else {
        return true;
    };
    let Some(actual) = actual else {
        return false;
    };
    wanted
        .elements()
        .iter()
        .all(|e| actual.get_value(e.name()) == Some(e.value()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bson::element::{Element, Value};
    use crate::server::ProbeReply;

    fn writable_server() -> Server {
        let server = Server::new("a:27017");
        common::async_std::task::block_on(server.apply_probe(&ProbeReply {
            is_master: true,
            ..Default::default()
        }));
        server
    }

    fn secondary_with_tag(key: &str, value: &str) -> Server {
        let server = Server::new("b:27017");
        let mut tags = Document::new();
        tags.push(Element::new(key, Value::String(value.to_string())).unwrap())
            .unwrap();
        common::async_std::task::block_on(server.apply_probe(&ProbeReply {
            is_master: false,
            secondary: true,
            tags: Some(tags),
            ..Default::default()
        }));
        server
    }

    #[test]
    fn primary_requires_writable_role() {
        assert!(ReadPreference::Primary.is_eligible(&writable_server()));
        assert!(!ReadPreference::Primary.is_eligible(&secondary_with_tag("dc", "east")));
    }

    #[test]
    fn secondary_with_tags_requires_matching_tag() {
        let pref = ReadPreference::Secondary {
            tags: {
                let mut d = Document::new();
                d.push(Element::new("dc", Value::String("east".to_string())).unwrap())
                    .unwrap();
                Some(d)
            },
        };
        assert!(pref.is_eligible(&secondary_with_tag("dc", "east")));
        assert!(!pref.is_eligible(&secondary_with_tag("dc", "west")));
    }

    #[test]
    fn secondary_preferred_falls_back_to_primary() {
        let pref = ReadPreference::SecondaryPreferred { tags: None };
        assert!(pref.is_eligible(&writable_server()));
    }
}
