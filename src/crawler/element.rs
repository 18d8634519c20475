use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Interaction verb suggested by the in-page detector for an element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InteractionVerb {
    Fill,
    Check,
    Uncheck,
    SelectOption,
    Click,
    Hover,
    Drag,
}

impl InteractionVerb {
    /// Whether this verb is handled by the form interaction path
    pub fn is_form_style(&self) -> bool {
        matches!(
            self,
            InteractionVerb::Fill
                | InteractionVerb::Check
                | InteractionVerb::Uncheck
                | InteractionVerb::SelectOption
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionVerb::Fill => "fill",
            InteractionVerb::Check => "check",
            InteractionVerb::Uncheck => "uncheck",
            InteractionVerb::SelectOption => "selectOption",
            InteractionVerb::Click => "click",
            InteractionVerb::Hover => "hover",
            InteractionVerb::Drag => "drag",
        }
    }
}

/// Suggested interaction attached to a detected element
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestedInteraction {
    pub action: InteractionVerb,
}

/// One interactive element as reported by the in-page detector.
///
/// The element path is an XPath-like locator and acts as the stable identity
/// key when merging observations across viewports.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementDescriptor {
    pub element_path: String,

    #[serde(default)]
    pub tag_name: String,

    #[serde(default)]
    pub attributes: HashMap<String, String>,

    #[serde(rename = "playwrightInteraction")]
    pub interaction: SuggestedInteraction,
}

impl ElementDescriptor {
    /// Short identifier derived from the last path segment, used for
    /// artifact naming and logs
    pub fn short_id(&self) -> String {
        self.element_path
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("element")
            .to_string()
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(|s| s.as_str())
    }
}

/// Result of one detector invocation on a page
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionReport {
    #[serde(default)]
    pub interactive_elements: Vec<ElementDescriptor>,

    #[serde(default)]
    pub website_info: Value,

    #[serde(default)]
    pub viewport_size: Value,

    #[serde(default)]
    pub scroll_position: Value,
}

/// Vertical scrollability metrics computed once per page
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scrollability {
    /// Whether the page extends beyond one viewport
    pub can_scroll: bool,

    /// Number of viewport-sized frames covering the page
    pub total_viewports: usize,

    /// Current scroll position in pixels
    pub current_position: i64,

    /// Precomputed absolute scroll offset for each viewport
    pub viewport_offsets: Vec<i64>,
}

impl Default for Scrollability {
    fn default() -> Self {
        // Degraded fallback used when the probe fails or times out
        Self {
            can_scroll: false,
            total_viewports: 1,
            current_position: 0,
            viewport_offsets: vec![0],
        }
    }
}

/// One same-page navigation edge observed during an interaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedirectEdge {
    pub from_url: String,
    pub to_url: String,
    pub redirect_number: usize,
}

/// Evidence captured from a popup opened by an interaction.
///
/// Popups are never driven further; this summary is all that survives them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PopupCapture {
    pub url: String,
    pub element_count: usize,
    pub discovered_urls: Vec<String>,
    pub screenshot_stored: bool,
}

/// Immutable record of one interaction attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionRecord {
    pub element_id: String,
    pub element_path: String,
    pub interaction_type: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default)]
    pub redirects: Vec<RedirectEdge>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_tab: Option<PopupCapture>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub form_value: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_path: Option<String>,
}

/// Normalized result of processing one URL, handed back to the scheduler.
/// Never mutated after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlOutcome {
    pub url: String,
    pub domain: String,
    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub elements: Vec<ElementDescriptor>,
    pub discovered_urls: Vec<String>,
    pub interactions_count: usize,
    pub viewport_count: usize,
    pub timestamp: DateTime<Utc>,

    /// True when this URL was itself found during interaction exploration;
    /// such URLs never contribute further discoveries
    pub is_discovered: bool,
}

impl UrlOutcome {
    pub fn failed(url: &str, domain: &str, is_discovered: bool, error: String) -> Self {
        Self {
            url: url.to_string(),
            domain: domain.to_string(),
            success: false,
            error: Some(error),
            elements: Vec::new(),
            discovered_urls: Vec::new(),
            interactions_count: 0,
            viewport_count: 0,
            timestamp: Utc::now(),
            is_discovered,
        }
    }
}

/// Merge a detector observation into the per-URL element map.
///
/// Keyed by element path; on conflict the observation carrying more
/// attributes wins, regardless of arrival order.
pub fn merge_element(map: &mut HashMap<String, ElementDescriptor>, element: ElementDescriptor) {
    if element.element_path.is_empty() {
        return;
    }

    match map.get(&element.element_path) {
        Some(existing) if existing.attributes.len() >= element.attributes.len() => {}
        _ => {
            map.insert(element.element_path.clone(), element);
        }
    }
}

/// Group merged elements by their suggested verb
pub fn group_by_verb(
    elements: &HashMap<String, ElementDescriptor>,
) -> HashMap<InteractionVerb, Vec<ElementDescriptor>> {
    let mut groups: HashMap<InteractionVerb, Vec<ElementDescriptor>> = HashMap::new();
    for element in elements.values() {
        groups
            .entry(element.interaction.action)
            .or_default()
            .push(element.clone());
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(path: &str, attrs: &[(&str, &str)]) -> ElementDescriptor {
        ElementDescriptor {
            element_path: path.to_string(),
            tag_name: "input".to_string(),
            attributes: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            interaction: SuggestedInteraction {
                action: InteractionVerb::Fill,
            },
        }
    }

    #[test]
    fn merge_keeps_richer_observation() {
        let sparse = element("/html/body/input[1]", &[("type", "text"), ("id", "q")]);
        let rich = element(
            "/html/body/input[1]",
            &[
                ("type", "text"),
                ("id", "q"),
                ("name", "query"),
                ("placeholder", "Search"),
                ("class", "search-box"),
            ],
        );

        // Sparse first, rich second
        let mut map = HashMap::new();
        merge_element(&mut map, sparse.clone());
        merge_element(&mut map, rich.clone());
        assert_eq!(map["/html/body/input[1]"].attributes.len(), 5);

        // Rich first, sparse second
        let mut map = HashMap::new();
        merge_element(&mut map, rich);
        merge_element(&mut map, sparse);
        assert_eq!(map["/html/body/input[1]"].attributes.len(), 5);
    }

    #[test]
    fn merge_ignores_empty_paths() {
        let mut map = HashMap::new();
        merge_element(&mut map, element("", &[("type", "text")]));
        assert!(map.is_empty());
    }

    #[test]
    fn short_id_uses_last_path_segment() {
        let el = element("/html/body/div[2]/input[1]", &[]);
        assert_eq!(el.short_id(), "input[1]");
    }

    #[test]
    fn verbs_deserialize_from_detector_payload() {
        let json = serde_json::json!({
            "elementPath": "/html/body/a[1]",
            "tagName": "a",
            "attributes": {"href": "/about"},
            "playwrightInteraction": {"action": "click"}
        });
        let el: ElementDescriptor = serde_json::from_value(json).unwrap();
        assert_eq!(el.interaction.action, InteractionVerb::Click);
        assert!(!el.interaction.action.is_form_style());
    }
}
