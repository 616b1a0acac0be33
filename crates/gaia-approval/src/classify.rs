//! Classification of raw provider updates into an exhaustive command enum.
//! Unknown callback verbs become an explicit `Unsupported` case rather than
//! silently no-opping.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

fn text_command_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?:/)?(approve|deny)\s+([0-9a-fA-F\-]{6,})\b")
            .unwrap_or_else(|error| panic!("invalid text command pattern: {error}"))
    })
}

/// Who sent the update and where to answer them.
#[derive(Debug, Clone, PartialEq)]
pub struct Origin {
    pub chat_id: String,
    pub message_id: String,
    pub from: Value,
    /// Stable principal used for approver checks.
    pub principal: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqVerb {
    Do,
    More,
    Skip,
    SubDo,
    SubMore,
    SubSkip,
}

impl SeqVerb {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "do" => Some(Self::Do),
            "more" => Some(Self::More),
            "skip" => Some(Self::Skip),
            "subdo" => Some(Self::SubDo),
            "submore" => Some(Self::SubMore),
            "subskip" => Some(Self::SubSkip),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Do => "do",
            Self::More => "more",
            Self::Skip => "skip",
            Self::SubDo => "subdo",
            Self::SubMore => "submore",
            Self::SubSkip => "subskip",
        }
    }
}

/// Everything an inbound update can mean to the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Approve {
        origin: Origin,
        callback_query_id: Option<String>,
        pending_ref: String,
    },
    Deny {
        origin: Origin,
        callback_query_id: Option<String>,
        pending_ref: String,
    },
    Info {
        origin: Origin,
        callback_query_id: String,
        pending_ref: String,
    },
    Proceed {
        origin: Origin,
        callback_query_id: String,
        pending_ref: String,
    },
    ProceedDisabled {
        origin: Origin,
        callback_query_id: String,
        pending_ref: String,
    },
    Sequence {
        origin: Origin,
        callback_query_id: String,
        verb: SeqVerb,
        seq_id: String,
        step: String,
        sub: Option<String>,
    },
    /// Plain application text, routed out as a `command.input` event.
    Input { origin: Origin, text: String },
    Unsupported {
        origin: Option<Origin>,
        detail: String,
    },
}

fn string_at(value: &Value, key: &str) -> String {
    match value.get(key) {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Number(number)) => number.to_string(),
        _ => String::new(),
    }
}

fn origin_of(container: &Value) -> Origin {
    let from = container.get("from").cloned().unwrap_or(Value::Null);
    let chat_id = container
        .get("chat")
        .map(|chat| string_at(chat, "id"))
        .unwrap_or_default();
    Origin {
        chat_id,
        message_id: string_at(container, "message_id"),
        principal: string_at(&from, "id"),
        from,
    }
}

/// Classifies one raw provider update.
pub fn classify(update: &Value) -> Inbound {
    if let Some(callback) = update.get("callback_query") {
        return classify_callback(callback);
    }
    if let Some(message) = update.get("message") {
        let origin = origin_of(message);
        let text = string_at(message, "text");
        if let Some(captures) = text_command_regex().captures(&text) {
            let pending_ref = captures[2].to_string();
            return match &captures[1] {
                "approve" => Inbound::Approve {
                    origin,
                    callback_query_id: None,
                    pending_ref,
                },
                _ => Inbound::Deny {
                    origin,
                    callback_query_id: None,
                    pending_ref,
                },
            };
        }
        if !text.is_empty() {
            return Inbound::Input { origin, text };
        }
        return Inbound::Unsupported {
            origin: Some(origin),
            detail: "message without text".to_string(),
        };
    }
    Inbound::Unsupported {
        origin: None,
        detail: "update is neither message nor callback_query".to_string(),
    }
}

fn classify_callback(callback: &Value) -> Inbound {
    let callback_query_id = string_at(callback, "id");
    let mut origin = callback
        .get("message")
        .map(origin_of)
        .unwrap_or(Origin {
            chat_id: String::new(),
            message_id: String::new(),
            from: Value::Null,
            principal: String::new(),
        });
    // The pressing user, not the message author, is the principal.
    if let Some(from) = callback.get("from") {
        origin.principal = string_at(from, "id");
        origin.from = from.clone();
    }
    let data = string_at(callback, "data");

    if let Some(rest) = data.strip_prefix("seq:") {
        let parts: Vec<&str> = rest.split(':').collect();
        if let [verb, seq_id, step, tail @ ..] = parts.as_slice() {
            if let Some(verb) = SeqVerb::parse(verb) {
                return Inbound::Sequence {
                    origin,
                    callback_query_id,
                    verb,
                    seq_id: (*seq_id).to_string(),
                    step: (*step).to_string(),
                    sub: tail.first().map(|sub| (*sub).to_string()),
                };
            }
        }
        return Inbound::Unsupported {
            origin: Some(origin),
            detail: format!("unsupported sequence callback: {data}"),
        };
    }

    let Some((verb, argument)) = data.split_once(':') else {
        return Inbound::Unsupported {
            origin: Some(origin),
            detail: format!("callback data without verb: {data}"),
        };
    };
    let pending_ref = argument.to_string();
    match verb {
        "approve" => Inbound::Approve {
            origin,
            callback_query_id: Some(callback_query_id),
            pending_ref,
        },
        "deny" => Inbound::Deny {
            origin,
            callback_query_id: Some(callback_query_id),
            pending_ref,
        },
        "info" => Inbound::Info {
            origin,
            callback_query_id,
            pending_ref,
        },
        "proceed" => Inbound::Proceed {
            origin,
            callback_query_id,
            pending_ref,
        },
        "proceed_disabled" => Inbound::ProceedDisabled {
            origin,
            callback_query_id,
            pending_ref,
        },
        other => Inbound::Unsupported {
            origin: Some(origin),
            detail: format!("unsupported callback verb: {other}"),
        },
    }
}
