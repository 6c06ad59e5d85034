use std::path::PathBuf;

use clap::Parser;
use quantbench_core::JudgeMode;

#[derive(Parser, Debug)]
#[command(
    name = "quantbench",
    version,
    about = "Benchmark quantized model variants against a baseline and judge their answers"
)]
pub struct Cli {
    /// Target model family (`llama3.1`) or registry path (`hf.co/ns/repo`)
    #[arg(long)]
    pub model: Option<String>,

    /// Comma-separated variant tags or wildcards (`q4_0,q8_0`, `Q4*`, `*`)
    #[arg(long, value_delimiter = ',')]
    pub quants: Vec<String>,

    /// Tag every other variant is judged against (defaults to a stored or
    /// well-known half-precision tag)
    #[arg(long)]
    pub base: Option<String>,

    /// Similarity judge: a server model (`qwen2.5:14b`, optionally
    /// `model@http://host:port`) or a cloud provider (`@claude`,
    /// `@openai:key/model`, ...)
    #[arg(long)]
    pub judge: Option<String>,

    /// Separate judge for the best-answer pass (same formats as --judge)
    #[arg(long)]
    pub judgebest: Option<String>,

    #[arg(long, value_enum, default_value_t = JudgeModeArg::Serial)]
    pub judgemode: JudgeModeArg,

    /// Judge context length; 0 derives it from the question context
    #[arg(long, default_value_t = 0)]
    pub judgectx: u64,

    /// Per-request timeout in seconds (doubled on confirmation after
    /// repeated timeouts)
    #[arg(long, default_value_t = 300)]
    pub timeout: u64,

    #[arg(long, default_value_t = 42)]
    pub seed: i64,

    #[arg(long, default_value_t = 0.0)]
    pub temperature: f64,

    #[arg(long = "top-p", default_value_t = 1.0)]
    pub top_p: f64,

    #[arg(long = "top-k", default_value_t = 1)]
    pub top_k: i64,

    #[arg(long = "repeat-penalty", default_value_t = 1.0)]
    pub repeat_penalty: f64,

    #[arg(long = "frequency-penalty", default_value_t = 0.0)]
    pub frequency_penalty: f64,

    /// Forward thinking mode to the inference server
    #[arg(long)]
    pub think: bool,

    /// Opaque thinking level forwarded verbatim (implies thinking)
    #[arg(long)]
    pub thinklevel: Option<String>,

    /// Re-run every variant, discarding stored answers
    #[arg(long)]
    pub force: bool,

    /// Re-run every judgment without retesting
    #[arg(long)]
    pub rejudge: bool,

    /// Pull missing models and delete them after complete results
    #[arg(long)]
    pub ondemand: bool,

    /// Skip the proactive unload before loading a variant
    #[arg(long)]
    pub nounloadall: bool,

    /// Per-judgment diagnostic lines instead of progress bars
    #[arg(long)]
    pub verbose: bool,

    /// Results document path (default derived from the model name)
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// External test suite file (YAML)
    #[arg(long)]
    pub testsuite: Option<PathBuf>,

    /// Repair a results document and write a `.fixed.json` sibling
    #[arg(long, value_name = "FILE")]
    pub fix: Option<PathBuf>,

    /// List cloud judge providers and their key sources
    #[arg(long = "help-cloud")]
    pub help_cloud: bool,

    /// Append diagnostics to this file instead of stderr
    #[arg(long)]
    pub logfile: Option<PathBuf>,

    /// Repository URL recorded in the results document
    #[arg(long)]
    pub repository: Option<String>,

    /// Inference server endpoint
    #[arg(long, default_value = "http://localhost:11434", env = "QUANTBENCH_HOST")]
    pub endpoint: String,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum JudgeModeArg {
    #[default]
    Serial,
    Parallel,
}

impl From<JudgeModeArg> for JudgeMode {
    fn from(arg: JudgeModeArg) -> Self {
        match arg {
            JudgeModeArg::Serial => JudgeMode::Serial,
            JudgeModeArg::Parallel => JudgeMode::Parallel,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_core_surface() {
        let cli = Cli::parse_from([
            "quantbench",
            "--model",
            "llama3.1",
            "--quants",
            "q4_0,q8_0",
            "--base",
            "fp16",
            "--judge",
            "@claude",
            "--judgemode",
            "parallel",
            "--ondemand",
            "--timeout",
            "120",
        ]);
        assert_eq!(cli.model.as_deref(), Some("llama3.1"));
        assert_eq!(cli.quants, vec!["q4_0", "q8_0"]);
        assert_eq!(cli.base.as_deref(), Some("fp16"));
        assert_eq!(cli.judgemode, JudgeModeArg::Parallel);
        assert!(cli.ondemand);
        assert_eq!(cli.timeout, 120);
    }

    #[test]
    fn fix_needs_no_model() {
        let cli = Cli::parse_from(["quantbench", "--fix", "broken.qc.json"]);
        assert!(cli.model.is_none());
        assert_eq!(cli.fix.as_deref(), Some(std::path::Path::new("broken.qc.json")));
    }
}
