use garde::Validate;

/// Request to analyze a single hosted video.
#[derive(Debug, Clone, Validate)]
pub struct SingleAnalysisRequest {
    #[garde(length(min = 1), custom(is_http_url))]
    pub video_url: String,

    /// Spoken-language hint for transcription; "auto" lets the service detect.
    #[garde(skip)]
    pub transcription_language: String,

    /// Language the transcript is translated into.
    #[garde(ascii, length(min = 2, max = 8))]
    pub target_language: String,
}

impl SingleAnalysisRequest {
    pub fn new(video_url: impl Into<String>, target_language: impl Into<String>) -> Self {
        Self {
            video_url: video_url.into(),
            transcription_language: "auto".to_string(),
            target_language: target_language.into(),
        }
    }
}

/// Spreadsheet upload for bulk analysis.
#[derive(Debug, Clone, Validate)]
pub struct BatchSubmission {
    #[garde(length(min = 1), custom(is_spreadsheet_name))]
    pub file_name: String,

    /// Raw spreadsheet bytes, forwarded to the service as-is.
    #[garde(length(min = 1))]
    pub payload: Vec<u8>,

    #[garde(ascii, length(min = 2, max = 8))]
    pub target_language: String,
}

impl BatchSubmission {
    pub fn new(
        file_name: impl Into<String>,
        payload: Vec<u8>,
        target_language: impl Into<String>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            payload,
            target_language: target_language.into(),
        }
    }
}

fn is_http_url(value: &str, _context: &()) -> garde::Result {
    if value.starts_with("http://") || value.starts_with("https://") {
        Ok(())
    } else {
        Err(garde::Error::new("must be an http(s) URL"))
    }
}

fn is_spreadsheet_name(value: &str, _context: &()) -> garde::Result {
    let lower = value.to_ascii_lowercase();
    if lower.ends_with(".xlsx") || lower.ends_with(".xls") {
        Ok(())
    } else {
        Err(garde::Error::new("expected an Excel file (.xlsx or .xls)"))
    }
}
