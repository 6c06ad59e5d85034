//! Terminal layer: renders core progress events with indicatif, owns the
//! two-stage Ctrl-C confirmation and the timeout-extension prompt.

use std::io::IsTerminal;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dialoguer::{theme::ColorfulTheme, Confirm};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use quantbench_core::{
    CancelController, CancelStage, JudgeProgress, PullProgress, Reporter, TestProgress,
    TimeoutArbiter, TimeoutVerdict,
};

use crate::exit_codes;

struct Bars {
    multi: MultiProgress,
    test: Mutex<Option<ProgressBar>>,
    judge: Mutex<Option<ProgressBar>>,
    pull: Mutex<Option<ProgressBar>>,
}

impl Bars {
    fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            test: Mutex::new(None),
            judge: Mutex::new(None),
            pull: Mutex::new(None),
        }
    }

    fn test_bar(&self, total: u64) -> ProgressBar {
        let mut slot = self.test.lock().expect("test bar lock");
        slot.get_or_insert_with(|| {
            let bar = self.multi.add(ProgressBar::new(total));
            bar.set_style(
                ProgressStyle::with_template(
                    "{prefix:>12} [{bar:30.cyan/blue}] {pos}/{len} questions",
                )
                .expect("static template")
                .progress_chars("=> "),
            );
            bar
        })
        .clone()
    }

    fn judge_bar(&self, total: u64) -> ProgressBar {
        let mut slot = self.judge.lock().expect("judge bar lock");
        slot.get_or_insert_with(|| {
            let bar = self.multi.add(ProgressBar::new(total));
            bar.set_style(
                ProgressStyle::with_template(
                    "{prefix:>12} [{bar:30.magenta/blue}] {pos}/{len} judgments",
                )
                .expect("static template")
                .progress_chars("=> "),
            );
            bar.set_prefix("judge");
            bar
        })
        .clone()
    }

    fn pull_bar(&self, total: u64) -> ProgressBar {
        let mut slot = self.pull.lock().expect("pull bar lock");
        slot.get_or_insert_with(|| {
            let bar = self.multi.add(ProgressBar::new(total));
            bar.set_style(
                ProgressStyle::with_template(
                    "{prefix:>12} [{bar:30.green/blue}] {bytes}/{total_bytes} {bytes_per_sec} eta {eta} {msg}",
                )
                .expect("static template")
                .progress_chars("=> "),
            );
            bar.set_prefix("pull");
            bar
        })
        .clone()
    }
}

/// Build the engine reporter. Verbose mode trades the bars for plain
/// per-event lines.
pub fn build_reporter(verbose: bool) -> Reporter {
    if verbose {
        return Reporter {
            on_test: Arc::new(|p: TestProgress| {
                eprintln!("[test] {} {}/{}", p.tag, p.done, p.total);
            }),
            on_judge: Arc::new(|p: JudgeProgress| {
                eprintln!("[judge] {}/{}", p.done, p.total);
            }),
            on_pull: Arc::new(|p: PullProgress| {
                if p.total > 0 {
                    eprintln!("[pull] {} {} {}/{}", p.model, p.status, p.completed, p.total);
                } else {
                    eprintln!("[pull] {} {}", p.model, p.status);
                }
            }),
            on_message: Arc::new(|m: &str| eprintln!("{m}")),
        };
    }

    let bars = Arc::new(Bars::new());
    let b = bars.clone();
    let on_test = Arc::new(move |p: TestProgress| {
        let bar = b.test_bar(p.total as u64);
        bar.set_prefix(p.tag.clone());
        bar.set_length(p.total as u64);
        bar.set_position(p.done as u64);
    });
    let b = bars.clone();
    let on_judge = Arc::new(move |p: JudgeProgress| {
        let bar = b.judge_bar(p.total as u64);
        bar.set_length(p.total as u64);
        bar.set_position(p.done as u64);
    });
    let b = bars.clone();
    let on_pull = Arc::new(move |p: PullProgress| {
        let bar = b.pull_bar(p.total.max(1));
        if p.total > 0 {
            bar.set_length(p.total);
            bar.set_position(p.completed);
        }
        bar.set_message(p.status.clone());
    });
    let b = bars;
    let on_message = Arc::new(move |m: &str| {
        let _ = b.multi.println(m);
    });

    Reporter {
        on_test,
        on_judge,
        on_pull,
        on_message,
    }
}

/// Two-stage interrupt handling: an unconfirmed Ctrl-C resumes, a
/// confirmed one cancels the run (exit 2 after the partial save), a
/// second confirmed one force-saves, a third hard-exits.
pub fn spawn_interrupt_handler(cancel: CancelController) {
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            match cancel.stage() {
                CancelStage::Running => {
                    if confirm_cancel().await {
                        cancel.confirm();
                        eprintln!("cancelling; saving partial results...");
                    } else {
                        eprintln!("resuming");
                    }
                }
                CancelStage::Confirmed => {
                    cancel.confirm();
                    eprintln!("force save and exit...");
                }
                CancelStage::Force => {
                    std::process::exit(exit_codes::CANCELLED);
                }
            }
        }
    });
}

async fn confirm_cancel() -> bool {
    if !std::io::stdin().is_terminal() {
        return true;
    }
    tokio::task::spawn_blocking(|| {
        Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt("Cancel the run and save partial results?")
            .default(false)
            .interact()
            .unwrap_or(true)
    })
    .await
    .unwrap_or(true)
}

/// y = cancel, n = double the per-request timeout and restart the retry
/// budget. Non-interactive environments auto-extend.
pub struct PromptArbiter;

#[async_trait]
impl TimeoutArbiter for PromptArbiter {
    async fn on_repeated_timeouts(&self, op: &str, current: Duration) -> TimeoutVerdict {
        if !std::io::stdin().is_terminal() {
            tracing::warn!(op, ?current, "repeated timeouts; extending request budget");
            return TimeoutVerdict::ExtendAndRetry;
        }
        let prompt = format!(
            "'{op}' timed out repeatedly (current budget {}s). Cancel? ('n' doubles the timeout)",
            current.as_secs()
        );
        let abort = tokio::task::spawn_blocking(move || {
            Confirm::with_theme(&ColorfulTheme::default())
                .with_prompt(prompt)
                .default(false)
                .interact()
                .unwrap_or(false)
        })
        .await
        .unwrap_or(false);
        if abort {
            TimeoutVerdict::Abort
        } else {
            TimeoutVerdict::ExtendAndRetry
        }
    }
}
