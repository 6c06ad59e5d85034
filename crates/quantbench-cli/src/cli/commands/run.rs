//! The primary command: drive the QC engine for one run.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use quantbench_core::{
    CancelController, EngineConfig, QcEngine, RunOptions, RunSummary, TestSuite,
};

use crate::cli::args::Cli;
use crate::console;
use crate::exit_codes;

pub async fn run(cli: Cli) -> anyhow::Result<i32> {
    let model = cli
        .model
        .clone()
        .context("--model is required (see --help)")?;
    anyhow::ensure!(
        !cli.quants.is_empty(),
        "--quants is required (tags or wildcards, comma separated)"
    );

    let suite = match &cli.testsuite {
        Some(path) => TestSuite::from_yaml_file(path)?,
        None => TestSuite::builtin(),
    };

    let options = RunOptions {
        temperature: cli.temperature,
        seed: cli.seed,
        top_p: cli.top_p,
        top_k: cli.top_k,
        repeat_penalty: cli.repeat_penalty,
        frequency_penalty: cli.frequency_penalty,
        think: cli.think || cli.thinklevel.is_some(),
        think_level: cli.thinklevel.clone(),
    };

    let cfg = EngineConfig {
        model,
        quants: cli.quants.clone(),
        base_tag: cli.base.clone(),
        suite,
        options,
        judge: cli.judge.clone(),
        judge_best: cli.judgebest.clone(),
        judge_mode: cli.judgemode.into(),
        judge_ctx: cli.judgectx,
        request_timeout: Duration::from_secs(cli.timeout.max(1)),
        force: cli.force,
        rejudge: cli.rejudge,
        on_demand: cli.ondemand,
        no_unload_all: cli.nounloadall,
        verbose: cli.verbose,
        output: cli.output.clone(),
        endpoint: cli.endpoint.clone(),
        repository_url: cli.repository.clone(),
    };

    let cancel = CancelController::new();
    console::spawn_interrupt_handler(cancel.clone());

    let reporter = console::build_reporter(cli.verbose);
    let engine = QcEngine::new(cfg, cancel, Arc::new(console::PromptArbiter), reporter)?;

    let exit = engine.run().await;
    if let Some(summary) = &exit.summary {
        print_summary(summary);
    }
    debug_assert!(matches!(
        exit.code,
        exit_codes::SUCCESS | exit_codes::ERROR | exit_codes::CANCELLED
    ));
    Ok(exit.code)
}

fn print_summary(summary: &RunSummary) {
    println!("\nresults: {}", summary.document_path.display());
    for v in &summary.variants {
        let marker = if v.is_base { " (base)" } else { "" };
        let score = v
            .mean_score
            .map(|s| format!("{s:.1}"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<16} {:>3} questions  mean score {:>5}  {:>7.1} tok/s{marker}",
            v.tag, v.questions, score, v.mean_eval_tps
        );
    }
}
