//! Name encoding for workflows, steps, and registered classes.
//!
//! Names are `<kind>//<moduleSpecifier>//<item>` where the module specifier is
//! either a package-qualified `pkg@version` or an app-relative `./path`. The
//! build pipeline assigns these; the runtime only parses and routes on them.

use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// Topic prefix for workflow invocation messages.
pub const WORKFLOW_TOPIC_PREFIX: &str = "__wkf_workflow_";

/// Topic prefix for step invocation messages.
pub const STEP_TOPIC_PREFIX: &str = "__wkf_step_";

/// Error raised when a qualified name does not parse.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    #[error("expected {expected}//<module>//<item>, got {got:?}")]
    Malformed { expected: &'static str, got: String },

    #[error("empty {part} in qualified name {got:?}")]
    EmptyPart { part: &'static str, got: String },
}

fn parse_qualified<'a>(kind: &'static str, s: &'a str) -> Result<(&'a str, &'a str), NameError> {
    let malformed = || NameError::Malformed {
        expected: kind,
        got: s.to_string(),
    };

    let rest = s
        .strip_prefix(kind)
        .and_then(|r| r.strip_prefix("//"))
        .ok_or_else(malformed)?;
    let (module, item) = rest.rsplit_once("//").ok_or_else(malformed)?;

    if module.is_empty() {
        return Err(NameError::EmptyPart {
            part: "module specifier",
            got: s.to_string(),
        });
    }
    if item.is_empty() || item.contains("//") {
        return Err(NameError::EmptyPart {
            part: "item",
            got: s.to_string(),
        });
    }

    Ok((module, item))
}

macro_rules! define_name {
    ($(#[$meta:meta])* $name:ident, $kind:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name {
            module: String,
            item: String,
        }

        impl $name {
            /// Builds a name from its module specifier and item name.
            pub fn new(module: impl Into<String>, item: impl Into<String>) -> Self {
                Self {
                    module: module.into(),
                    item: item.into(),
                }
            }

            /// The encoding kind (`workflow`, `step` or `class`).
            #[must_use]
            pub const fn kind() -> &'static str {
                $kind
            }

            /// The module specifier (`pkg@version` or `./relative/path`).
            #[must_use]
            pub fn module_specifier(&self) -> &str {
                &self.module
            }

            /// The exported item name.
            #[must_use]
            pub fn item(&self) -> &str {
                &self.item
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}//{}//{}", $kind, self.module, self.item)
            }
        }

        impl FromStr for $name {
            type Err = NameError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let (module, item) = parse_qualified($kind, s)?;
                Ok(Self {
                    module: module.to_string(),
                    item: item.to_string(),
                })
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(de::Error::custom)
            }
        }
    };
}

define_name!(
    /// Fully-qualified workflow name, e.g. `workflow//./flows.ts//addTen`.
    WorkflowName,
    "workflow"
);

define_name!(
    /// Fully-qualified step name, e.g. `step//./math.ts//add`.
    StepName,
    "step"
);

define_name!(
    /// Fully-qualified class id for registered serializable types.
    ClassName,
    "class"
);

impl WorkflowName {
    /// Queue topic carrying invocations of this workflow.
    #[must_use]
    pub fn topic(&self) -> String {
        format!("{WORKFLOW_TOPIC_PREFIX}{self}")
    }

    /// Recovers the workflow name from a queue topic.
    pub fn from_topic(topic: &str) -> Result<Self, NameError> {
        let name = topic.strip_prefix(WORKFLOW_TOPIC_PREFIX).ok_or_else(|| {
            NameError::Malformed {
                expected: "workflow",
                got: topic.to_string(),
            }
        })?;
        name.parse()
    }
}

impl StepName {
    /// Queue topic carrying invocations of this step.
    #[must_use]
    pub fn topic(&self) -> String {
        format!("{STEP_TOPIC_PREFIX}{self}")
    }

    /// Recovers the step name from a queue topic.
    pub fn from_topic(topic: &str) -> Result<Self, NameError> {
        let name = topic
            .strip_prefix(STEP_TOPIC_PREFIX)
            .ok_or_else(|| NameError::Malformed {
                expected: "step",
                got: topic.to_string(),
            })?;
        name.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_workflow_name() {
        let name = WorkflowName::new("./flows.ts", "addTen");
        assert_eq!(name.to_string(), "workflow//./flows.ts//addTen");

        let parsed: WorkflowName = name.to_string().parse().expect("should parse");
        assert_eq!(parsed, name);
        assert_eq!(parsed.module_specifier(), "./flows.ts");
        assert_eq!(parsed.item(), "addTen");
    }

    #[test]
    fn package_qualified_module() {
        let name: StepName = "step//some-pkg@1.2.3//fetchUser".parse().expect("parse");
        assert_eq!(name.module_specifier(), "some-pkg@1.2.3");
        assert_eq!(name.item(), "fetchUser");
    }

    #[test]
    fn rejects_wrong_kind() {
        let result: Result<WorkflowName, _> = "step//./flows.ts//addTen".parse();
        assert!(result.is_err());
    }

    #[test]
    fn rejects_missing_item() {
        let result: Result<ClassName, _> = "class//./models.ts//".parse();
        assert!(matches!(result, Err(NameError::EmptyPart { .. })));
    }

    #[test]
    fn topic_roundtrip() {
        let name = WorkflowName::new("./flows.ts", "addTen");
        let topic = name.topic();
        assert!(topic.starts_with(WORKFLOW_TOPIC_PREFIX));
        assert_eq!(WorkflowName::from_topic(&topic).expect("parse"), name);
    }

    #[test]
    fn step_topic_roundtrip() {
        let name = StepName::new("my-lib@0.4.0", "sendEmail");
        assert_eq!(StepName::from_topic(&name.topic()).expect("parse"), name);
    }

    #[test]
    fn serde_as_string() {
        let name = StepName::new("./math.ts", "add");
        let json = serde_json::to_string(&name).expect("serialize");
        assert_eq!(json, "\"step//./math.ts//add\"");
        let parsed: StepName = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, name);
    }
}
