//! Turning non-text message parts into text the engine can read.

use async_trait::async_trait;

use crate::api::protocol::{ContentPart, MessageContent};
use crate::error::GatewayError;

/// Describes media in words. The engine only sees text.
#[async_trait]
pub trait MediaAnnotator: Send + Sync {
    async fn annotate_image(&self, url: &str) -> Result<String, GatewayError>;

    async fn transcribe_audio(&self, data: &str, format: &str) -> Result<String, GatewayError>;
}

/// Fixed placeholders, used when no vision or speech model is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaceholderAnnotator;

#[async_trait]
impl MediaAnnotator for PlaceholderAnnotator {
    async fn annotate_image(&self, _url: &str) -> Result<String, GatewayError> {
        Ok("<image>a photo.</image>".to_string())
    }

    async fn transcribe_audio(&self, _data: &str, format: &str) -> Result<String, GatewayError> {
        Ok(format!(
            "<audio format=\"{format}\">An audio without speech recognition</audio>"
        ))
    }
}

/// Flatten message content to text. Media parts become a newline plus
/// their annotation.
pub async fn message_text(
    annotator: &dyn MediaAnnotator,
    content: &MessageContent,
) -> Result<String, GatewayError> {
    let parts = match content {
        MessageContent::Text(text) => return Ok(text.clone()),
        MessageContent::Parts(parts) => parts,
    };

    let mut text = String::new();
    for part in parts {
        match part {
            ContentPart::Text { text: part } => text.push_str(part),
            ContentPart::ImageUrl { image_url } => {
                text.push('\n');
                text.push_str(&annotator.annotate_image(&image_url.url).await?);
            }
            ContentPart::Audio { input_audio } => {
                text.push('\n');
                text.push_str(
                    &annotator
                        .transcribe_audio(&input_audio.data, &input_audio.format)
                        .await?,
                );
            }
        }
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::protocol::{ImageUrl, InputAudio};

    #[tokio::test]
    async fn media_parts_become_placeholders() {
        let content = MessageContent::Parts(vec![
            ContentPart::Text {
                text: "look:".into(),
            },
            ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: "http://x/cat.png".into(),
                },
            },
            ContentPart::Audio {
                input_audio: InputAudio {
                    data: "AAAA".into(),
                    format: "mp3".into(),
                },
            },
        ]);

        let text = message_text(&PlaceholderAnnotator, &content).await.unwrap();
        assert_eq!(
            text,
            "look:\n<image>a photo.</image>\n<audio format=\"mp3\">An audio without speech recognition</audio>"
        );
    }

    #[tokio::test]
    async fn plain_text_passes_through() {
        let content = MessageContent::Text("hello".into());
        assert_eq!(message_text(&PlaceholderAnnotator, &content).await.unwrap(), "hello");
    }
}
