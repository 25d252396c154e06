//! Progress bar rendering of DFU callbacks.

use indicatif::{HumanBytes, ProgressBar, ProgressStyle};

use grdfu_core::{DfuError, DfuListener};

pub struct ProgressListener {
    bar: ProgressBar,
}

impl ProgressListener {
    pub fn new() -> Self {
        let bar = ProgressBar::new(100);
        let style = ProgressStyle::with_template(
            "{msg:<32} [{elapsed}] [{wide_bar:.blue/white}] {pos:>3}% {prefix}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#> ");
        bar.set_style(style);
        Self { bar }
    }
}

impl Default for ProgressListener {
    fn default() -> Self {
        Self::new()
    }
}

impl DfuListener for ProgressListener {
    fn on_dfu_start(&self) {
        self.bar.reset();
        self.bar.set_message("Starting...");
    }

    fn on_dfu_progress(&self, percent: u8, speed: u32, status: &str) {
        self.bar.set_position(u64::from(percent));
        self.bar.set_message(status.to_string());
        if speed > 0 {
            self.bar
                .set_prefix(format!("{}/s", HumanBytes(u64::from(speed))));
        }
    }

    fn on_dfu_complete(&self) {
        self.bar.finish_with_message("DFU complete");
    }

    fn on_dfu_error(&self, message: &str, _cause: &DfuError) {
        self.bar.abandon_with_message(format!("DFU failed: {}", message));
    }
}
