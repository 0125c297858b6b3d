use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Server-issued identifiers are opaque strings; the wrappers only keep them
/// from being mixed up.
macro_rules! opaque_id {
    ($name:ident) => {
        #[derive(Clone, Debug, Default, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// First eight characters, the form shown in chat.
            pub fn short(&self) -> &str {
                match self.0.char_indices().nth(8) {
                    Some((idx, _)) => &self.0[..idx],
                    None => &self.0,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

opaque_id!(SessionId);
opaque_id!(RequestId);
opaque_id!(MachineId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_takes_eight_chars() {
        let id = SessionId::from_raw("0123456789abcdef");
        assert_eq!(id.short(), "01234567");
    }

    #[test]
    fn short_keeps_shorter_ids_whole() {
        assert_eq!(SessionId::from_raw("abc").short(), "abc");
        assert_eq!(SessionId::from_raw("").short(), "");
    }

    #[test]
    fn short_respects_char_boundaries() {
        let id = RequestId::from_raw("ééééééééé");
        assert_eq!(id.short(), "éééééééé");
    }

    #[test]
    fn serde_is_transparent() {
        let id = SessionId::from_raw("sess-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"sess-1\"");
        let back: SessionId = serde_json::from_str("\"sess-1\"").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn ids_order_lexically() {
        let mut ids = vec![RequestId::from("b"), RequestId::from("a")];
        ids.sort();
        assert_eq!(ids[0].as_str(), "a");
    }
}
