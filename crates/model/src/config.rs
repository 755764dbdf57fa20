use candle_core::{Device, Error, Result};

/// Hyperparameters for the reference-panel similarity model.
#[derive(Debug, Clone)]
pub struct AgnosticConfig {
    pub n_classes: usize,
    pub seq_len: usize,
    pub window_size: usize,
    pub smoother_kernel: usize,
    pub seed: u64,
    pub device: Device,
}

impl AgnosticConfig {
    /// Validate structural invariants before any parameter is allocated.
    pub fn validate(&self) -> Result<()> {
        if self.n_classes < 2 {
            return Err(Error::Msg("n_classes must be at least 2".into()));
        }
        if self.seq_len == 0 {
            return Err(Error::Msg("seq_len must be greater than zero".into()));
        }
        if self.window_size == 0 {
            return Err(Error::Msg("window_size must be greater than zero".into()));
        }
        if self.window_size > self.seq_len {
            return Err(Error::Msg(format!(
                "window_size ({}) cannot exceed seq_len ({})",
                self.window_size, self.seq_len
            )));
        }
        if self.smoother_kernel == 0 || self.smoother_kernel % 2 == 0 {
            return Err(Error::Msg(format!(
                "smoother_kernel must be odd and positive (got {})",
                self.smoother_kernel
            )));
        }
        Ok(())
    }

    /// Number of smoother windows; the trailing window absorbs any remainder.
    pub fn n_windows(&self) -> usize {
        (self.seq_len + self.window_size - 1) / self.window_size
    }
}
