//! Canonical, provider-neutral message representation.
//!
//! `ContentPart` is a tagged union rather than a class hierarchy: every adapter
//! matches on `ContentPart` directly instead of downcasting, and unknown tags
//! round-trip through `ContentPart::Unknown` instead of being rejected.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single piece of message content.
///
/// Serde's internal tagging can't express "preserve unrecognized tags", so
/// `Serialize`/`Deserialize` are implemented by hand below via a JSON
/// intermediate instead of `#[serde(tag = "type")]`.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentPart {
    Text(TextPart),
    Think(ThinkPart),
    ImageUrl(ImageUrlPart),
    AudioUrl(AudioUrlPart),
    /// Any tag this build doesn't know about. Preserved verbatim so a
    /// round-trip through an unfamiliar provider extension doesn't lose data.
    Unknown(UnknownPart),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TextPart {
    pub text: String,
}

/// A reasoning summary. `encrypted` carries an opaque signature or ciphertext
/// binding the thought to the provider response; once set, the part is sealed
/// and may no longer merge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ThinkPart {
    pub think: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageUrlPart {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioUrlPart {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// A part whose `type` tag this build doesn't recognize. `raw` retains the
/// full JSON object (minus the `type` key) so it can be re-emitted unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct UnknownPart {
    pub tag: String,
    pub raw: serde_json::Map<String, serde_json::Value>,
}

impl Serialize for ContentPart {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let (tag, value) = match self {
            ContentPart::Text(t) => ("text", serde_json::to_value(t)),
            ContentPart::Think(t) => ("think", serde_json::to_value(t)),
            ContentPart::ImageUrl(t) => ("image_url", serde_json::to_value(t)),
            ContentPart::AudioUrl(t) => ("audio_url", serde_json::to_value(t)),
            ContentPart::Unknown(u) => {
                let mut map = u.raw.clone();
                map.insert("type".to_string(), serde_json::Value::String(u.tag.clone()));
                return serde_json::Value::Object(map).serialize(serializer);
            }
        };
        let mut value = value.map_err(serde::ser::Error::custom)?;
        if let serde_json::Value::Object(map) = &mut value {
            map.insert("type".to_string(), serde_json::Value::String(tag.to_string()));
        }
        value.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ContentPart {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        let obj = value
            .as_object()
            .ok_or_else(|| serde::de::Error::custom("content part must be a JSON object"))?;
        let tag = obj
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| serde::de::Error::custom("content part missing `type` tag"))?
            .to_string();

        match tag.as_str() {
            "text" => Ok(ContentPart::Text(
                serde_json::from_value(value).map_err(serde::de::Error::custom)?,
            )),
            "think" => Ok(ContentPart::Think(
                serde_json::from_value(value).map_err(serde::de::Error::custom)?,
            )),
            "image_url" => Ok(ContentPart::ImageUrl(
                serde_json::from_value(value).map_err(serde::de::Error::custom)?,
            )),
            "audio_url" => Ok(ContentPart::AudioUrl(
                serde_json::from_value(value).map_err(serde::de::Error::custom)?,
            )),
            _ => {
                let mut raw = obj.clone();
                raw.remove("type");
                Ok(ContentPart::Unknown(UnknownPart { tag, raw }))
            }
        }
    }
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text(TextPart { text: text.into() })
    }

    pub fn think(think: impl Into<String>) -> Self {
        ContentPart::Think(ThinkPart {
            think: think.into(),
            encrypted: None,
        })
    }

    /// Attempt to merge `other` into `self` in place, per the rules in
    /// the streaming merge algorithm (see `crate::merge`). Returns `false`
    /// (leaving `self` untouched) when the combination does not merge.
    pub fn merge_in_place(&mut self, other: &ContentPart) -> bool {
        match (self, other) {
            (ContentPart::Text(a), ContentPart::Text(b)) => {
                a.text.push_str(&b.text);
                true
            }
            (ContentPart::Think(a), ContentPart::Think(b)) => {
                if a.encrypted.is_some() {
                    return false;
                }
                a.think.push_str(&b.think);
                if b.encrypted.is_some() {
                    a.encrypted = b.encrypted.clone();
                }
                true
            }
            _ => false,
        }
    }
}

/// The function body of a tool call: its name and its (possibly partially
/// assembled) JSON-string arguments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct FunctionBody {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

/// A model-declared tool invocation. `arguments` is a JSON string that may be
/// assembled incrementally from one or more `ToolCallPart` deltas.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub function: FunctionBody,
    /// Provider-specific annotations (e.g. Anthropic cache controls) that ride
    /// alongside the call without being part of the canonical shape.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extras: HashMap<String, serde_json::Value>,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Option<String>) -> Self {
        Self {
            id: id.into(),
            function: FunctionBody {
                name: name.into(),
                arguments,
            },
            extras: HashMap::new(),
        }
    }

    /// Parse `arguments` as JSON, defaulting absent/empty arguments to `{}`.
    pub fn parsed_arguments(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self.function.arguments.as_deref() {
            None => Ok(serde_json::json!({})),
            Some(s) if s.trim().is_empty() => Ok(serde_json::json!({})),
            Some(s) => serde_json::from_str(s),
        }
    }
}

/// A streamed fragment of a tool call's arguments. Merges into the
/// immediately preceding `ToolCall` or `ToolCallPart` by string concatenation.
/// An orphaned fragment (no preceding call) is discarded by the merger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallPart {
    pub arguments_part: String,
}

/// A part of a message as it streams off the wire, before the merger has
/// assembled it into a final `ContentPart`/`ToolCall`.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamedPart {
    Content(ContentPart),
    ToolCall(ToolCall),
    ToolCallPart(ToolCallPart),
}

/// Conversation role. Some wire formats additionally use `developer`; that is
/// a per-adapter rename, not a distinct canonical role.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A message in the conversation history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub content: Vec<ContentPart>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial: Option<bool>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<Vec<ContentPart>>) -> Self {
        Self {
            role,
            name: None,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
            partial: None,
        }
    }

    /// Wrap a bare string as a single-`TextPart` message, per §3.3's rule for
    /// callers that supply plain text instead of a content-part list.
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self::new(role, vec![ContentPart::text(text)])
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::text(Role::User, text)
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::text(Role::System, text)
    }

    pub fn tool_result(tool_call_id: impl Into<String>, text: impl Into<String>) -> Self {
        let mut m = Self::text(Role::Tool, text);
        m.tool_call_id = Some(tool_call_id.into());
        m
    }

    /// Concatenation of every `TextPart` in `content`, in order. Convenience
    /// for adapters and tests that only care about the plain-text view.
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text(t) => Some(t.text.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// A JSON-Schema-described callable the model may invoke.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Token accounting for one generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input + self.output
    }
}

/// The outcome of one `generate` call after the streaming merge has run.
#[derive(Debug, Clone)]
pub struct GenerateResult {
    pub id: Option<String>,
    pub message: Message,
    pub usage: Option<TokenUsage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_parts_merge_by_concatenation() {
        let mut a = ContentPart::text("Hello, ");
        assert!(a.merge_in_place(&ContentPart::text("world")));
        assert!(a.merge_in_place(&ContentPart::text("!")));
        assert_eq!(a, ContentPart::text("Hello, world!"));
    }

    #[test]
    fn think_parts_merge_until_sealed() {
        let mut a = ContentPart::think("A");
        assert!(a.merge_in_place(&ContentPart::think("B")));
        let sealed = ContentPart::Think(ThinkPart {
            think: String::new(),
            encrypted: Some("sig".to_string()),
        });
        assert!(a.merge_in_place(&sealed));
        match &a {
            ContentPart::Think(t) => {
                assert_eq!(t.think, "AB");
                assert_eq!(t.encrypted.as_deref(), Some("sig"));
            }
            _ => panic!("expected ThinkPart"),
        }
        // already sealed: further merges fail
        assert!(!a.merge_in_place(&ContentPart::think("C")));
    }

    #[test]
    fn mismatched_parts_do_not_merge() {
        let mut a = ContentPart::text("hi");
        assert!(!a.merge_in_place(&ContentPart::think("nope")));
    }

    #[test]
    fn bare_string_wraps_as_single_text_part() {
        let m = Message::user("hi there");
        assert_eq!(m.content, vec![ContentPart::text("hi there")]);
    }

    #[test]
    fn token_usage_totals() {
        let u = TokenUsage {
            input: 10,
            output: 5,
        };
        assert_eq!(u.total(), 15);
    }

    #[test]
    fn unknown_content_part_round_trips() {
        let json = serde_json::json!({"type": "video_url", "url": "https://x/y.mp4"});
        let part: ContentPart = serde_json::from_value(json.clone()).unwrap();
        match &part {
            ContentPart::Unknown(u) => assert_eq!(u.tag, "video_url"),
            _ => panic!("expected Unknown"),
        }
        let back = serde_json::to_value(&part).unwrap();
        assert_eq!(back, json);
    }
}
