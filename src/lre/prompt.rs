// SPDX-License-Identifier: MIT OR Apache-2.0

//! Few-shot prompt rendering.
//!
//! A template holds a single `{}` subject slot. Demonstrations are rendered
//! as `template(subject) + " " + object`, one per line, and the query line
//! `template(query)` comes last:
//!
//! ```
//! use candle_lre::data::Sample;
//! use candle_lre::lre::prompt::make_prompt;
//!
//! let demos = [Sample::new("France", "Paris")];
//! let prompt = make_prompt("The capital of {} is", &demos, "Japan");
//! assert_eq!(prompt, "The capital of France is Paris\nThe capital of Japan is");
//! ```

use crate::data::Sample;

/// Subject placeholder in templates.
pub const SUBJECT_SLOT: &str = "{}";

/// Substitute `subject` into every `{}` slot of `template`.
#[must_use]
pub fn render(template: &str, subject: &str) -> String {
    template.replace(SUBJECT_SLOT, subject)
}

/// Render `demos` followed by the query line for `subject`.
#[must_use]
pub fn make_prompt(template: &str, demos: &[Sample], subject: &str) -> String {
    let mut lines: Vec<String> = demos
        .iter()
        .map(|demo| format!("{} {}", render(template, &demo.subject), demo.object))
        .collect();
    lines.push(render(template, subject));
    lines.join("\n")
}

/// Few-shot template: `demos` baked in, query slot left open.
#[must_use]
pub fn icl_template(template: &str, demos: &[Sample]) -> String {
    make_prompt(template, demos, SUBJECT_SLOT)
}
