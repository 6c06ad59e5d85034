//! `--help-cloud`: print the cloud judge provider registry.

use quantbench_core::judge::cloud::PROVIDERS;

use crate::exit_codes;

pub fn run() -> anyhow::Result<i32> {
    println!("Cloud judge providers (use with --judge / --judgebest):\n");
    for p in PROVIDERS {
        println!("  {:<14} provider: {}", p.token, p.name);
        println!("  {:<14} default model: {}", "", p.default_model);
        if !p.endpoint.is_empty() {
            println!("  {:<14} endpoint: {}", "", p.endpoint);
        }
        println!("  {:<14} key env: {}", "", p.env_keys.join(", "));
        if let Some(v) = p.api_version {
            println!("  {:<14} api version: {v}", "");
        }
        println!();
    }
    println!("Key formats: @provider, @provider:key, @provider:key/model.");
    println!("Azure: @azure:key@https://<resource>.openai.azure.com (endpoint also via AZURE_OPENAI_ENDPOINT).");
    Ok(exit_codes::SUCCESS)
}
