//! Test suite: an ordered battery of categories and questions. Context
//! length resolves question > category > suite. Suites load from YAML
//! files; a compact built-in battery keeps the binary usable without one.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ctx_size: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ctx_size: Option<u64>,
    pub questions: Vec<Question>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSuite {
    pub name: String,
    /// Upper bound on tokens generated per answer.
    pub max_predict: u64,
    /// Default context length when neither category nor question overrides.
    pub ctx_size: u64,
    pub categories: Vec<Category>,
}

impl TestSuite {
    pub fn total_questions(&self) -> usize {
        self.categories.iter().map(|c| c.questions.len()).sum()
    }

    /// question > category > suite.
    pub fn resolve_ctx(&self, category: &Category, question: &Question) -> u64 {
        question
            .ctx_size
            .or(category.ctx_size)
            .unwrap_or(self.ctx_size)
    }

    pub fn question_ids(&self) -> impl Iterator<Item = &str> {
        self.categories
            .iter()
            .flat_map(|c| c.questions.iter().map(|q| q.id.as_str()))
    }

    pub fn from_yaml_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read test suite {}", path.display()))?;
        let suite: TestSuite = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse test suite {}", path.display()))?;
        suite.validate()?;
        Ok(suite)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.categories.is_empty() {
            anyhow::bail!("test suite '{}' has no categories", self.name);
        }
        let mut seen = std::collections::HashSet::new();
        for c in &self.categories {
            for q in &c.questions {
                if !seen.insert(q.id.as_str()) {
                    anyhow::bail!("test suite '{}' has duplicate question id '{}'", self.name, q.id);
                }
            }
        }
        Ok(())
    }

    /// The built-in battery used when no external suite file is supplied.
    pub fn builtin() -> Self {
        fn q(id: &str, prompt: &str) -> Question {
            Question {
                id: id.into(),
                prompt: prompt.into(),
                ctx_size: None,
            }
        }

        TestSuite {
            name: "default".into(),
            max_predict: 2048,
            ctx_size: 4096,
            categories: vec![
                Category {
                    name: "reasoning".into(),
                    ctx_size: None,
                    questions: vec![
                        q("reasoning-01",
                          "A farmer has 17 sheep. All but 9 run away. How many sheep are left? Explain your reasoning step by step."),
                        q("reasoning-02",
                          "If yesterday was two days before Friday, what day is tomorrow? Show how you arrive at the answer."),
                        q("reasoning-03",
                          "Three switches outside a room control three lamps inside. You may flip switches freely but enter the room only once. How do you determine which switch controls which lamp?"),
                        q("reasoning-04",
                          "A bat and a ball cost 1.10 in total. The bat costs 1.00 more than the ball. How much does the ball cost? Explain why the intuitive answer is wrong."),
                    ],
                },
                Category {
                    name: "math".into(),
                    ctx_size: None,
                    questions: vec![
                        q("math-01",
                          "Compute 847 * 36 without using a calculator, showing the intermediate steps."),
                        q("math-02",
                          "Solve for x: 3x^2 - 12x + 9 = 0. Show the factorization."),
                        q("math-03",
                          "A rectangle's perimeter is 54 and its length is twice its width. What is its area?"),
                        q("math-04",
                          "What is the sum of all integers from 1 to 200? State the formula you used."),
                    ],
                },
                Category {
                    name: "code".into(),
                    ctx_size: Some(8192),
                    questions: vec![
                        q("code-01",
                          "Write a function that returns the n-th Fibonacci number iteratively, in any mainstream language, and explain its time complexity."),
                        q("code-02",
                          "Given a list of integers, write code that removes duplicates while preserving the original order. Explain the data structures used."),
                        q("code-03",
                          "Explain the difference between a mutex and a semaphore, and give a short example where each is the right tool."),
                        q("code-04",
                          "Write a function that validates whether a string of brackets ()[]{} is balanced, and walk through its behavior on the input \"([)]\"."),
                    ],
                },
                Category {
                    name: "knowledge".into(),
                    ctx_size: None,
                    questions: vec![
                        q("knowledge-01",
                          "Summarize the causes of the First World War in one paragraph."),
                        q("knowledge-02",
                          "Explain how a refrigerator keeps food cold, in terms a curious teenager would follow."),
                        q("knowledge-03",
                          "What is the difference between weather and climate? Give one concrete example of each."),
                        q("knowledge-04",
                          "Name the four largest planets of the solar system in descending size order and one notable feature of each."),
                    ],
                },
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn builtin_suite_is_consistent() {
        let suite = TestSuite::builtin();
        assert_eq!(suite.total_questions(), 16);
        suite.validate().expect("builtin suite validates");
    }

    #[test]
    fn ctx_resolution_order() {
        let suite = TestSuite::builtin();
        let code = suite
            .categories
            .iter()
            .find(|c| c.name == "code")
            .expect("code category");
        let plain = &code.questions[0];
        assert_eq!(suite.resolve_ctx(code, plain), 8192);

        let reasoning = &suite.categories[0];
        assert_eq!(suite.resolve_ctx(reasoning, &reasoning.questions[0]), 4096);

        let q = Question {
            id: "x".into(),
            prompt: "p".into(),
            ctx_size: Some(1024),
        };
        assert_eq!(suite.resolve_ctx(code, &q), 1024);
    }

    #[test]
    fn yaml_round_trip() {
        let suite = TestSuite::builtin();
        let yaml = serde_yaml::to_string(&suite).expect("serialize");
        let mut f = tempfile::NamedTempFile::new().expect("tmp");
        f.write_all(yaml.as_bytes()).expect("write");
        let loaded = TestSuite::from_yaml_file(f.path()).expect("load");
        assert_eq!(loaded.total_questions(), suite.total_questions());
        assert_eq!(loaded.name, suite.name);
    }

    #[test]
    fn duplicate_question_ids_rejected() {
        let mut suite = TestSuite::builtin();
        let dup = suite.categories[0].questions[0].clone();
        suite.categories[1].questions.push(dup);
        assert!(suite.validate().is_err());
    }
}
