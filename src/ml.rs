//! On-device ML collaborators. The engines themselves live outside this
//! crate; the pipeline only sees these request/response seams.

use std::path::Path;

use crate::error::Result;

/// Marks recognizer output that is a failure message rather than screen text.
pub const OCR_ERROR_PREFIX: &str = "Error:";

/// Text extraction. Implementations report failures inside the returned
/// text, prefixed with [`OCR_ERROR_PREFIX`], never through a structured
/// channel.
pub trait TextRecognizer: Send + Sync {
    fn recognize(&self, image: &Path) -> String;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Description {
    Caption(String),
    /// The captioning capability is being fetched; retry later.
    Downloading,
}

/// Visual description. An implementation whose capability is not installed
/// starts fetching it and answers [`Description::Downloading`].
pub trait ImageDescriber: Send + Sync {
    fn describe(&self, image: &Path) -> Result<Description>;
}

/// Stand-in used when no OCR engine is compiled in.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableRecognizer;

impl TextRecognizer for UnavailableRecognizer {
    fn recognize(&self, _image: &Path) -> String {
        format!("{OCR_ERROR_PREFIX} text recognition is not available in this build")
    }
}

#[cfg(feature = "tesseract")]
pub use self::tesseract_ocr::TesseractRecognizer;

#[cfg(feature = "tesseract")]
mod tesseract_ocr {
    use std::path::Path;
    use tesseract::Tesseract;
    use tracing::debug;

    use super::{TextRecognizer, OCR_ERROR_PREFIX};

    /// libtesseract-backed recognizer.
    #[derive(Debug, Clone)]
    pub struct TesseractRecognizer {
        language: String,
    }

    impl Default for TesseractRecognizer {
        fn default() -> Self {
            Self::new("eng")
        }
    }

    impl TesseractRecognizer {
        pub fn new(language: impl Into<String>) -> Self {
            Self {
                language: language.into(),
            }
        }

        fn run(&self, path: &Path) -> Result<String, String> {
            let path_str = path
                .to_str()
                .ok_or_else(|| "Image path is not valid UTF-8".to_string())?;

            let tesseract = Tesseract::new(None, Some(self.language.as_str()))
                .map_err(|error| format!("{error}"))?;

            // Page segmentation and engine mode are optimizations only.
            let tesseract = match tesseract
                .set_variable("tessedit_pageseg_mode", "3")
                .and_then(|t| t.set_variable("oem", "1"))
            {
                Ok(configured) => configured,
                Err(error) => {
                    debug!("tesseract tuning rejected ({error}), using defaults");
                    Tesseract::new(None, Some(self.language.as_str()))
                        .map_err(|error| format!("{error}"))?
                }
            };

            tesseract
                .set_image(path_str)
                .map_err(|error| format!("{error}"))?
                .get_text()
                .map_err(|error| format!("{error}"))
        }
    }

    impl TextRecognizer for TesseractRecognizer {
        fn recognize(&self, image: &Path) -> String {
            match self.run(image) {
                Ok(text) => text,
                Err(error) => format!("{OCR_ERROR_PREFIX} {error}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::sanitize_ocr_text;

    #[test]
    fn unavailable_recognizer_reports_error_text() {
        let text = UnavailableRecognizer.recognize(Path::new("/tmp/shot.png"));
        assert_eq!(sanitize_ocr_text(&text), None);
    }
}
