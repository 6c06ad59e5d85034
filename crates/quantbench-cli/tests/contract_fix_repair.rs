//! Contract: a document truncated mid-question-result is repairable, the
//! repaired copy parses, the partial question result is dropped, and the
//! repair statistics report what was cut.

use quantbench_core::model::{QuestionResult, ResultsDocument, VariantResult};
use quantbench_core::{repair_document, RunOptions};

fn question(id: &str) -> QuestionResult {
    serde_json::from_value(serde_json::json!({
        "questionId": id,
        "category": "reasoning",
        "prompt": format!("prompt for {id}"),
        "answer": format!("a long answer for {id} with enough text to cut into"),
        "logprobs": [
            {"token": "a", "logprob": -0.25},
            {"token": "b", "logprob": -0.50}
        ],
        "evalTokensPerSecond": 42.0,
        "promptTokensPerSecond": 210.0,
        "totalTokens": 64,
        "ctxSize": 4096
    }))
    .expect("question fixture")
}

fn document() -> ResultsDocument {
    let mut doc = ResultsDocument::new("default", "llama3.1", RunOptions::default());
    let mut base = VariantResult::new("fp16", "llama3.1:fp16");
    base.is_base = true;
    base.questions.push(question("reasoning-01"));
    base.questions.push(question("reasoning-02"));
    base.questions.push(question("reasoning-03"));
    doc.upsert_variant(base);
    doc
}

#[test]
fn truncated_document_repairs_with_statistics() {
    let json = serde_json::to_string_pretty(&document()).expect("serialize");

    // Cut inside the third question's answer string.
    let cut = json.rfind("a long answer for reasoning-03").expect("marker") + 10;
    let truncated = &json[..cut];
    assert!(serde_json::from_str::<ResultsDocument>(truncated).is_err());

    let (repaired, stats) = repair_document(truncated).expect("recoverable");

    assert_eq!(repaired.variants.len(), 1);
    let v = &repaired.variants[0];
    assert_eq!(v.questions.len(), 2, "partial question result is dropped");
    assert!(v
        .questions
        .iter()
        .all(|q| q.question_id != "reasoning-03"));

    assert!(stats.truncated_arrays >= 1);
    assert!(stats.truncated_objects >= 1);
    assert!(stats.removed_bytes > 0);

    // The repaired document survives a full round trip.
    let round = serde_json::to_string(&repaired).expect("serialize repaired");
    serde_json::from_str::<ResultsDocument>(&round).expect("round trip");
}

#[test]
fn garbage_prefix_is_unrecoverable() {
    assert!(repair_document("not json at all").is_err());
}
