//! Engine backed by a local OpenAI-compatible server (llama.cpp, Ollama and
//! friends) that has the downloaded weights loaded.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::StreamExt;
use image::{DynamicImage, ImageFormat};
use reqwest::{header, Client};
use serde::Serialize;
use serde_json::Value;
use std::{io::Cursor, ops::ControlFlow, path::Path, time::Duration};
use tokio::runtime::Handle;
use tracing::debug;

use super::{GenerateRequest, LlmBackend, LlmEngine};
use crate::error::{Error, Result};
use crate::models::ModelDescriptor;

pub fn chat_completions_url(base_url: &str) -> String {
    format!("{}/chat/completions", base_url.trim_end_matches('/'))
}

#[derive(Debug, Serialize)]
struct ChatCompletionsRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
    top_k: u32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: Vec<ContentPart>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SseLine {
    Delta(String),
    Done,
    Skip,
}

/// Interprets one line of a chat-completions event stream.
pub(crate) fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.trim().strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let payload = data.trim();
    if payload == "[DONE]" {
        return SseLine::Done;
    }
    let Ok(value) = serde_json::from_str::<Value>(payload) else {
        return SseLine::Skip;
    };
    match value
        .pointer("/choices/0/delta/content")
        .or_else(|| value.pointer("/choices/0/message/content"))
        .and_then(Value::as_str)
    {
        Some(text) if !text.is_empty() => SseLine::Delta(text.to_string()),
        _ => SseLine::Skip,
    }
}

/// Splits a byte stream into lines. Bytes are only decoded once a whole line
/// is buffered, so characters split across network chunks stay intact.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub(crate) fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    pub(crate) fn next_line(&mut self) -> Result<Option<String>> {
        let Some(pos) = self.pending.iter().position(|b| *b == b'\n') else {
            return Ok(None);
        };
        let line: Vec<u8> = self.pending.drain(..=pos).collect();
        decode_line(line).map(Some)
    }

    /// Whatever is left once the stream ends without a trailing newline.
    pub(crate) fn finish(&mut self) -> Result<Option<String>> {
        if self.pending.is_empty() {
            return Ok(None);
        }
        decode_line(std::mem::take(&mut self.pending)).map(Some)
    }
}

fn decode_line(line: Vec<u8>) -> Result<String> {
    String::from_utf8(line)
        .map_err(|error| Error::Inference(format!("stream is not valid UTF-8: {error}")))
}

fn encode_png_data_url(image: &DynamicImage) -> Result<String> {
    let mut bytes = Vec::new();
    image.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
    Ok(format!("data:image/png;base64,{}", STANDARD.encode(&bytes)))
}

pub struct OpenAiCompatibleBackend {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiCompatibleBackend {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key,
        })
    }
}

impl LlmBackend for OpenAiCompatibleBackend {
    /// The server owns the weights; `weights` only names what it should have
    /// loaded.
    fn load(&self, model: &ModelDescriptor, weights: &Path) -> Result<Box<dyn LlmEngine>> {
        let runtime = Handle::try_current()
            .map_err(|_| Error::Config("the LLM backend needs a tokio runtime".to_string()))?;
        debug!(
            "using {} for {} ({})",
            self.base_url,
            model.name,
            weights.display()
        );
        Ok(Box::new(OpenAiCompatibleEngine {
            client: self.client.clone(),
            url: chat_completions_url(&self.base_url),
            api_key: self.api_key.clone(),
            model_name: model.name.clone(),
            runtime,
            history: Vec::new(),
        }))
    }
}

struct OpenAiCompatibleEngine {
    client: Client,
    url: String,
    api_key: Option<String>,
    model_name: String,
    runtime: Handle,
    history: Vec<ChatMessage>,
}

impl OpenAiCompatibleEngine {
    async fn stream(
        &self,
        body: &ChatCompletionsRequest,
        on_chunk: &mut dyn FnMut(&str) -> ControlFlow<()>,
    ) -> Result<String> {
        let mut request = self
            .client
            .post(&self.url)
            .header(header::ACCEPT, "text/event-stream")
            .json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let resp = request.send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::Inference(format!("HTTP {status} {text}")));
        }

        let mut stream = resp.bytes_stream();
        let mut lines = LineBuffer::default();
        let mut reply = String::new();
        let mut finished = false;
        while let Some(chunk) = stream.next().await {
            lines.push(&chunk?);
            while let Some(line) = lines.next_line()? {
                match parse_sse_line(&line) {
                    SseLine::Delta(text) => {
                        reply.push_str(&text);
                        if on_chunk(&text).is_break() {
                            return Ok(reply);
                        }
                    }
                    SseLine::Done => {
                        finished = true;
                        break;
                    }
                    SseLine::Skip => {}
                }
            }
            if finished {
                return Ok(reply);
            }
        }

        if let Some(line) = lines.finish()? {
            if let SseLine::Delta(text) = parse_sse_line(&line) {
                reply.push_str(&text);
                let _ = on_chunk(&text);
            }
        }
        Ok(reply)
    }
}

impl LlmEngine for OpenAiCompatibleEngine {
    fn generate(
        &mut self,
        request: &GenerateRequest<'_>,
        on_chunk: &mut dyn FnMut(&str) -> ControlFlow<()>,
    ) -> Result<()> {
        let mut content = vec![ContentPart::Text {
            text: request.prompt.to_string(),
        }];
        for image in request.images {
            content.push(ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: encode_png_data_url(image)?,
                },
            });
        }
        self.history.push(ChatMessage {
            role: "user",
            content,
        });

        let body = ChatCompletionsRequest {
            model: self.model_name.clone(),
            messages: std::mem::take(&mut self.history),
            max_tokens: request.decode.max_tokens,
            temperature: request.decode.temperature,
            top_p: request.decode.top_p,
            top_k: request.decode.top_k,
            stream: true,
        };

        let runtime = self.runtime.clone();
        let outcome = runtime.block_on(self.stream(&body, on_chunk));
        self.history = body.messages;

        match outcome {
            Ok(reply) => {
                self.history.push(ChatMessage {
                    role: "assistant",
                    content: vec![ContentPart::Text { text: reply }],
                });
                Ok(())
            }
            Err(error) => {
                self.history.pop();
                Err(error)
            }
        }
    }

    fn reset(&mut self) -> Result<()> {
        self.history.clear();
        Ok(())
    }
}
