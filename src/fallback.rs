use chrono::Utc;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Context bag supplied by route handlers to select a fallback payload.
///
/// Ordered so its serialized form is deterministic (cache keys depend on it).
pub type FallbackContext = BTreeMap<String, Value>;

/// Sub-keyed policy for one operation category
struct CategoryPolicy {
    by_module: HashMap<&'static str, Value>,
    default: Value,
}

impl CategoryPolicy {
    fn flat(default: Value) -> Self {
        Self {
            by_module: HashMap::new(),
            default,
        }
    }
}

/// Resolves static degraded responses when both the live call and the cache
/// have failed. The payloads are policy data; the only behavioral contract
/// is the `fallback: true` stamp and the timestamp.
pub struct FallbackPolicyEngine {
    policies: HashMap<&'static str, CategoryPolicy>,
}

impl Default for FallbackPolicyEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FallbackPolicyEngine {
    #[must_use]
    pub fn new() -> Self {
        let mut policies = HashMap::new();

        let mut suggestions = CategoryPolicy::flat(json!({
            "suggestions": [
                "Review the workshop inputs already captured",
                "Consult the EBIOS-RM method guide for this step",
            ],
            "confidence": "low",
            "source": "static_policy",
        }));
        suggestions.by_module.insert(
            "workshop1",
            json!({
                "suggestions": [
                    "List the business values the study scope depends on",
                    "Identify feared events for each business value",
                    "Rate the severity of each feared event",
                ],
                "confidence": "low",
                "source": "static_policy",
            }),
        );
        suggestions.by_module.insert(
            "workshop2",
            json!({
                "suggestions": [
                    "Inventory risk sources relevant to the study scope",
                    "Characterize each risk source's target objectives",
                    "Keep only source/objective pairs worth analyzing",
                ],
                "confidence": "low",
                "source": "static_policy",
            }),
        );
        suggestions.by_module.insert(
            "workshop3",
            json!({
                "suggestions": [
                    "Map the ecosystem stakeholders around the study scope",
                    "Build strategic scenarios from the retained risk sources",
                    "Assess stakeholder criticality before refining scenarios",
                ],
                "confidence": "low",
                "source": "static_policy",
            }),
        );
        suggestions.by_module.insert(
            "workshop4",
            json!({
                "suggestions": [
                    "Derive operational scenarios from each strategic scenario",
                    "Walk the attack path step by step and rate likelihood",
                ],
                "confidence": "low",
                "source": "static_policy",
            }),
        );
        suggestions.by_module.insert(
            "workshop5",
            json!({
                "suggestions": [
                    "Consolidate residual risks from the scenario analysis",
                    "Define the risk treatment plan and security measures",
                    "Plan the continuous improvement cycle",
                ],
                "confidence": "low",
                "source": "static_policy",
            }),
        );
        policies.insert("suggestions", suggestions);

        policies.insert(
            "semantic_analysis",
            CategoryPolicy::flat(json!({
                "entities": [],
                "relations": [],
                "coverage": 0.0,
                "note": "semantic analysis unavailable, returning empty extraction",
                "source": "static_policy",
            })),
        );

        policies.insert(
            "guidance",
            CategoryPolicy::flat(json!({
                "guidance": "The assistant is temporarily unavailable. Continue \
                             with the workshop checklist; your entries are saved \
                             and will be analyzed once the service recovers.",
                "source": "static_policy",
            })),
        );

        policies.insert(
            "risk_analysis",
            CategoryPolicy::flat(json!({
                "risk_level": "unknown",
                "findings": [],
                "note": "automated risk analysis unavailable, manual review required",
                "source": "static_policy",
            })),
        );

        Self { policies }
    }

    /// Resolve a degraded response for `category`.
    ///
    /// The `"module"` context field selects a sub-policy when one exists;
    /// otherwise the category default applies. Unknown categories yield a
    /// generic unavailable payload. Never fails.
    #[must_use]
    pub fn resolve(&self, category: &str, context: &FallbackContext) -> Value {
        let mut payload = match self.policies.get(category) {
            Some(policy) => {
                let module = context.get("module").and_then(Value::as_str);
                module
                    .and_then(|m| policy.by_module.get(m))
                    .unwrap_or(&policy.default)
                    .clone()
            }
            None => {
                debug!("No fallback policy for category '{}'", category);
                json!({ "error": "service unavailable" })
            }
        };

        if let Some(object) = payload.as_object_mut() {
            object.insert("fallback".to_string(), Value::Bool(true));
            object.insert(
                "timestamp".to_string(),
                Value::String(Utc::now().to_rfc3339()),
            );
        }
        payload
    }

    /// Known category names, for stats reporting
    #[must_use]
    pub fn categories(&self) -> Vec<String> {
        let mut names: Vec<String> = self.policies.keys().map(ToString::to_string).collect();
        names.sort_unstable();
        names
    }
}
