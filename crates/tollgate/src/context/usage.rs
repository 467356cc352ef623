//! Usage metering: turns working-memory text into the ratio that
//! [`CompressionManager::report_usage`](super::compression::CompressionManager::report_usage)
//! consumes.

/// Default characters per token (conservative estimate for English text).
/// Most tokenizers average 3-4 chars per token; we use 3.5 as a middle ground.
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 3.5;

/// Default context window size in tokens.
pub const DEFAULT_CONTEXT_WINDOW: usize = 200_000;

/// Estimates context usage from character counts.
///
/// # Example
///
/// ```ignore
/// let meter = UsageMeter::new().with_max_tokens(128_000).with_output_reserve(4096);
/// let usage = meter.estimate(&memory);
/// println!("{}", usage.to_log_string());
/// controller.report_usage(usage.ratio)?;
/// ```
#[derive(Debug, Clone)]
pub struct UsageMeter {
    max_tokens: usize,
    /// Tokens reserved for model output.
    output_reserve: usize,
    chars_per_token: f64,
}

impl Default for UsageMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageMeter {
    pub fn new() -> Self {
        Self {
            max_tokens: DEFAULT_CONTEXT_WINDOW,
            output_reserve: 0,
            chars_per_token: DEFAULT_CHARS_PER_TOKEN,
        }
    }

    /// Override the context window size (in tokens).
    pub fn with_max_tokens(mut self, max: usize) -> Self {
        self.max_tokens = max;
        self
    }

    pub fn with_output_reserve(mut self, tokens: usize) -> Self {
        self.output_reserve = tokens;
        self
    }

    /// Use a calibrated chars-per-token ratio. Non-positive values are ignored.
    pub fn with_chars_per_token(mut self, cpt: f64) -> Self {
        if cpt > 0.0 {
            self.chars_per_token = cpt;
        }
        self
    }

    /// Window minus the output reserve.
    pub fn effective_max_tokens(&self) -> usize {
        self.max_tokens.saturating_sub(self.output_reserve)
    }

    pub fn estimate_tokens(&self, text: &str) -> usize {
        (text.chars().count() as f64 / self.chars_per_token) as usize
    }

    pub fn estimate(&self, text: &str) -> UsageEstimate {
        let estimated_tokens = self.estimate_tokens(text);
        let effective = self.effective_max_tokens();
        let ratio = if effective > 0 {
            estimated_tokens as f64 / effective as f64
        } else {
            1.0
        };
        UsageEstimate {
            estimated_tokens,
            max_tokens: self.max_tokens,
            ratio,
        }
    }
}

/// Snapshot of context usage.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageEstimate {
    pub estimated_tokens: usize,
    pub max_tokens: usize,
    /// May exceed 1.0; the compression manager clamps.
    pub ratio: f64,
}

impl UsageEstimate {
    pub fn to_log_string(&self) -> String {
        format!(
            "context: ~{} tokens ({:.0}% of {})",
            self.estimated_tokens,
            self.ratio * 100.0,
            self.max_tokens,
        )
    }
}
