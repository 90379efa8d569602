//! Chat history and prompt templates.
//!
//! A template is resolved once per model from its metadata and is used to
//! render a role-tagged history into the prompt text the model was trained on.

use std::fmt::Write as _;

/// One entry of a chat history in engine terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatHistoryItem {
    System(String),
    User(String),
    /// A previous answer. Wire role `assistant`.
    Model(String),
}

impl ChatHistoryItem {
    pub fn text(&self) -> &str {
        match self {
            Self::System(text) | Self::User(text) | Self::Model(text) => text,
        }
    }
}

/// Prompt format families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChatTemplate {
    ChatMl,
    Llama3,
    Llama2,
    Gemma,
    Phi3,
    /// Plain markdown-style headings, for models with no recognizable format.
    General,
}

impl ChatTemplate {
    /// Pick a template from an embedded template string, the model
    /// architecture, or failing those the file name.
    pub fn resolve(embedded: Option<&str>, architecture: Option<&str>, file_name: &str) -> Self {
        embedded
            .and_then(Self::from_embedded)
            .or_else(|| architecture.and_then(Self::from_architecture))
            .or_else(|| Self::from_file_name(file_name))
            .unwrap_or(Self::General)
    }

    fn from_embedded(template: &str) -> Option<Self> {
        if template.contains("<|im_start|>") {
            Some(Self::ChatMl)
        } else if template.contains("<|start_header_id|>") {
            Some(Self::Llama3)
        } else if template.contains("<start_of_turn>") {
            Some(Self::Gemma)
        } else if template.contains("<|assistant|>") && template.contains("<|end|>") {
            Some(Self::Phi3)
        } else if template.contains("[INST]") {
            Some(Self::Llama2)
        } else {
            None
        }
    }

    fn from_architecture(architecture: &str) -> Option<Self> {
        let architecture = architecture.to_ascii_lowercase();
        if architecture.starts_with("qwen") {
            Some(Self::ChatMl)
        } else if architecture.starts_with("gemma") {
            Some(Self::Gemma)
        } else if architecture == "phi3" {
            Some(Self::Phi3)
        } else {
            None
        }
    }

    fn from_file_name(file_name: &str) -> Option<Self> {
        let name = file_name.to_ascii_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| name.contains(n));
        if has(&["llama-3", "llama3"]) {
            Some(Self::Llama3)
        } else if has(&["llama-2", "llama2"]) {
            Some(Self::Llama2)
        } else if has(&["qwen"]) {
            Some(Self::ChatMl)
        } else if has(&["gemma"]) {
            Some(Self::Gemma)
        } else if has(&["phi-3", "phi3"]) {
            Some(Self::Phi3)
        } else {
            None
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::ChatMl => "chatml",
            Self::Llama3 => "llama3",
            Self::Llama2 => "llama2",
            Self::Gemma => "gemma",
            Self::Phi3 => "phi3",
            Self::General => "general",
        }
    }

    /// Render a history, ending with an open model turn.
    pub fn render(self, history: &[ChatHistoryItem]) -> String {
        let mut out = String::new();
        match self {
            Self::ChatMl => {
                for item in history {
                    let role = match item {
                        ChatHistoryItem::System(_) => "system",
                        ChatHistoryItem::User(_) => "user",
                        ChatHistoryItem::Model(_) => "assistant",
                    };
                    let _ = write!(out, "<|im_start|>{role}\n{}<|im_end|>\n", item.text());
                }
                out.push_str("<|im_start|>assistant\n");
            }
            Self::Llama3 => {
                for item in history {
                    let role = match item {
                        ChatHistoryItem::System(_) => "system",
                        ChatHistoryItem::User(_) => "user",
                        ChatHistoryItem::Model(_) => "assistant",
                    };
                    let _ = write!(
                        out,
                        "<|start_header_id|>{role}<|end_header_id|>\n\n{}<|eot_id|>",
                        item.text()
                    );
                }
                out.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
            }
            Self::Llama2 => {
                let mut system: Option<&str> = None;
                for item in history {
                    match item {
                        ChatHistoryItem::System(text) => system = Some(text.as_str()),
                        ChatHistoryItem::User(text) => {
                            out.push_str("[INST] ");
                            if let Some(system) = system.take() {
                                let _ = write!(out, "<<SYS>>\n{system}\n<</SYS>>\n\n");
                            }
                            let _ = write!(out, "{text} [/INST]");
                        }
                        ChatHistoryItem::Model(text) => {
                            let _ = writeln!(out, " {text}");
                        }
                    }
                }
            }
            Self::Gemma => {
                // No system role; system text becomes a user turn.
                for item in history {
                    let role = match item {
                        ChatHistoryItem::System(_) | ChatHistoryItem::User(_) => "user",
                        ChatHistoryItem::Model(_) => "model",
                    };
                    let _ = write!(out, "<start_of_turn>{role}\n{}<end_of_turn>\n", item.text());
                }
                out.push_str("<start_of_turn>model\n");
            }
            Self::Phi3 => {
                for item in history {
                    let tag = match item {
                        ChatHistoryItem::System(_) => "<|system|>",
                        ChatHistoryItem::User(_) => "<|user|>",
                        ChatHistoryItem::Model(_) => "<|assistant|>",
                    };
                    let _ = write!(out, "{tag}{}<|end|>\n", item.text());
                }
                out.push_str("<|assistant|>");
            }
            Self::General => {
                for item in history {
                    let heading = match item {
                        ChatHistoryItem::System(_) => "### System message",
                        ChatHistoryItem::User(_) => "### Human",
                        ChatHistoryItem::Model(_) => "### Assistant",
                    };
                    let _ = write!(out, "{heading}\n{}\n\n", item.text());
                }
                out.push_str("### Assistant\n");
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_template_wins_over_architecture() {
        let template = ChatTemplate::resolve(
            Some("{% for m in messages %}<|im_start|>{{ m.role }}{% endfor %}"),
            Some("llama"),
            "model.gguf",
        );
        assert_eq!(template, ChatTemplate::ChatMl);
    }

    #[test]
    fn falls_back_through_architecture_and_file_name() {
        assert_eq!(ChatTemplate::resolve(None, Some("gemma2"), "x.gguf"), ChatTemplate::Gemma);
        assert_eq!(
            ChatTemplate::resolve(None, Some("llama"), "Meta-Llama-3-8B.Q4_K_M.gguf"),
            ChatTemplate::Llama3
        );
        assert_eq!(ChatTemplate::resolve(None, None, "mystery.gguf"), ChatTemplate::General);
    }

    #[test]
    fn chatml_render_opens_assistant_turn() {
        let rendered = ChatTemplate::ChatMl.render(&[
            ChatHistoryItem::System("be brief".into()),
            ChatHistoryItem::User("hi".into()),
        ]);
        assert_eq!(
            rendered,
            "<|im_start|>system\nbe brief<|im_end|>\n<|im_start|>user\nhi<|im_end|>\n<|im_start|>assistant\n"
        );
    }

    #[test]
    fn llama2_folds_system_into_first_instruction() {
        let rendered = ChatTemplate::Llama2.render(&[
            ChatHistoryItem::System("sys".into()),
            ChatHistoryItem::User("q".into()),
            ChatHistoryItem::Model("a".into()),
        ]);
        assert_eq!(rendered, "[INST] <<SYS>>\nsys\n<</SYS>>\n\nq [/INST] a\n");
    }

    #[test]
    fn general_render_of_empty_history() {
        assert_eq!(ChatTemplate::General.render(&[]), "### Assistant\n");
    }
}
