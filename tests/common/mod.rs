#![allow(dead_code)]

use std::{
    collections::HashMap,
    ops::ControlFlow,
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use screenshot_organizer_lib::{
    llm::GenerateRequest, Catalog, Description, Error, ImageDescriber, LlmBackend, LlmEngine,
    LlmSession, ModelDescriptor, Result, TextRecognizer,
};

pub fn catalog() -> Arc<Catalog> {
    Arc::new(Catalog::open_in_memory().expect("catalog"))
}

/// Returns canned OCR text per image and records how many calls overlap.
#[derive(Default)]
pub struct FakeRecognizer {
    texts: HashMap<String, String>,
    default_text: String,
    delay: Duration,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub calls: AtomicUsize,
}

impl FakeRecognizer {
    pub fn returning(text: &str) -> Self {
        Self {
            default_text: text.to_string(),
            ..Self::default()
        }
    }

    pub fn with_text(mut self, uri: &str, text: &str) -> Self {
        self.texts.insert(uri.to_string(), text.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl TextRecognizer for FakeRecognizer {
    fn recognize(&self, image: &Path) -> String {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let key = image.to_string_lossy().to_string();
        self.texts
            .get(&key)
            .cloned()
            .unwrap_or_else(|| self.default_text.clone())
    }
}

pub enum DescriberReply {
    Caption(String),
    Downloading,
    Fail,
}

pub struct FakeDescriber {
    replies: HashMap<String, DescriberReply>,
    default_caption: Option<String>,
}

impl FakeDescriber {
    pub fn captioning(caption: &str) -> Self {
        Self {
            replies: HashMap::new(),
            default_caption: Some(caption.to_string()),
        }
    }

    pub fn downloading() -> Self {
        Self {
            replies: HashMap::new(),
            default_caption: None,
        }
    }

    pub fn with_reply(mut self, uri: &str, reply: DescriberReply) -> Self {
        self.replies.insert(uri.to_string(), reply);
        self
    }
}

impl ImageDescriber for FakeDescriber {
    fn describe(&self, image: &Path) -> Result<Description> {
        let key = image.to_string_lossy().to_string();
        match self.replies.get(&key) {
            Some(DescriberReply::Caption(caption)) => Ok(Description::Caption(caption.clone())),
            Some(DescriberReply::Downloading) => Ok(Description::Downloading),
            Some(DescriberReply::Fail) => Err(Error::Inference("describer crashed".to_string())),
            None => match &self.default_caption {
                Some(caption) => Ok(Description::Caption(caption.clone())),
                None => Ok(Description::Downloading),
            },
        }
    }
}

/// Engine that answers every prompt with the same reply and remembers what
/// it was asked.
#[derive(Clone, Default)]
pub struct ScriptedLlm {
    pub reply: Arc<Mutex<String>>,
    pub prompts: Arc<Mutex<Vec<String>>>,
    pub image_counts: Arc<Mutex<Vec<usize>>>,
}

impl ScriptedLlm {
    pub fn replying(reply: &str) -> Self {
        let llm = Self::default();
        llm.set_reply(reply);
        llm
    }

    pub fn set_reply(&self, reply: &str) {
        *self.reply.lock().expect("lock") = reply.to_string();
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("lock").clone()
    }

    pub fn image_counts(&self) -> Vec<usize> {
        self.image_counts.lock().expect("lock").clone()
    }

    /// A session with this engine already loaded.
    pub fn session(&self, multimodal: bool) -> Arc<LlmSession> {
        let session = LlmSession::new(Arc::new(self.clone()));
        let mut model = screenshot_organizer_lib::models::builtin_models().remove(0);
        model.multimodal = multimodal;
        session
            .initialize(&model, Path::new("/models/fake.task"))
            .expect("initialize");
        Arc::new(session)
    }

    /// A session that never loaded a model.
    pub fn unloaded_session(&self) -> Arc<LlmSession> {
        Arc::new(LlmSession::new(Arc::new(self.clone())))
    }
}

impl LlmBackend for ScriptedLlm {
    fn load(&self, _model: &ModelDescriptor, _weights: &Path) -> Result<Box<dyn LlmEngine>> {
        Ok(Box::new(self.clone()))
    }
}

impl LlmEngine for ScriptedLlm {
    fn generate(
        &mut self,
        request: &GenerateRequest<'_>,
        on_chunk: &mut dyn FnMut(&str) -> ControlFlow<()>,
    ) -> Result<()> {
        self.prompts
            .lock()
            .expect("lock")
            .push(request.prompt.to_string());
        self.image_counts
            .lock()
            .expect("lock")
            .push(request.images.len());
        let reply = self.reply.lock().expect("lock").clone();
        let _ = on_chunk(&reply);
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        Ok(())
    }
}

pub const GOOD_REPLY: &str = r#"```json
{"title": "Flight to Lisbon", "summary": "Boarding pass for TP 1234.", "sourceApp": "TAP Air Portugal", "tags": ["travel", "flight", "boarding pass", "lisbon"]}
```"#;
