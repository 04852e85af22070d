//! Parsing of structured model responses.
//!
//! Rewrite prompts instruct the model to emit `DECISION:`, `ANSWER:` and
//! `QUESTION:` markers. Models decorate these with markdown more often than
//! not, so matching tolerates headers and bold markers around them.

const DECISION_MARKER: &str = "DECISION:";
const ANSWER_MARKER: &str = "ANSWER:";
const QUESTION_MARKER: &str = "QUESTION:";

/// Cap on questions forwarded to the user in a single exchange.
pub const MAX_QUESTIONS: usize = 5;

/// What the model decided to do with the validation feedback.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedDecision {
    Rewrite { answer: String },
    AskQuestions { questions: Vec<String> },
    Impossible { explanation: String },
}

/// Value after `marker` on this line, tolerating markdown decoration
/// (`## DECISION: X`, `**DECISION:** X`).
fn marker_value<'a>(line: &'a str, marker: &str) -> Option<&'a str> {
    let stripped = line.trim().trim_start_matches(['#', '*', ' ']);
    stripped
        .strip_prefix(marker)
        .map(|rest| rest.trim_matches('*').trim())
}

fn is_marker_line(line: &str) -> bool {
    marker_value(line, DECISION_MARKER).is_some()
        || marker_value(line, ANSWER_MARKER).is_some()
        || marker_value(line, QUESTION_MARKER).is_some()
}

/// Parse a rewrite-prompt response.
///
/// A response without a recognizable decision marker is treated as a
/// rewrite whose answer is the whole response. An ASK_QUESTIONS decision
/// with no actual questions falls back to a rewrite the same way, so a
/// half-followed format never dead-ends a thread.
pub fn parse_response(raw: &str) -> ParsedDecision {
    let lines: Vec<&str> = raw.lines().collect();

    let decision = lines
        .iter()
        .find_map(|line| marker_value(line, DECISION_MARKER))
        .map(|value| value.split_whitespace().next().unwrap_or("").to_string());

    let questions: Vec<String> = lines
        .iter()
        .filter_map(|line| marker_value(line, QUESTION_MARKER))
        .filter(|q| !q.is_empty())
        .take(MAX_QUESTIONS)
        .map(str::to_string)
        .collect();

    let body = answer_body(&lines, raw);

    match decision.as_deref() {
        Some("ASK_QUESTIONS") if !questions.is_empty() => {
            ParsedDecision::AskQuestions { questions }
        }
        Some("IMPOSSIBLE") => ParsedDecision::Impossible { explanation: body },
        _ => ParsedDecision::Rewrite { answer: body },
    }
}

/// Bare `QUESTION:` lines in free-form text, capped at [`MAX_QUESTIONS`].
///
/// Initial answers are not asked for the structured format, but a model
/// will sometimes open with questions anyway; this picks them up.
pub fn detect_questions(raw: &str) -> Vec<String> {
    raw.lines()
        .filter_map(|line| marker_value(line, QUESTION_MARKER))
        .filter(|q| !q.is_empty())
        .take(MAX_QUESTIONS)
        .map(str::to_string)
        .collect()
}

/// The answer text: everything after the `ANSWER:` marker when present,
/// otherwise the full response with marker lines removed.
fn answer_body(lines: &[&str], raw: &str) -> String {
    if let Some(idx) = lines
        .iter()
        .position(|line| marker_value(line, ANSWER_MARKER).is_some())
    {
        let mut parts: Vec<&str> = Vec::new();
        if let Some(first) = marker_value(lines[idx], ANSWER_MARKER) {
            if !first.is_empty() {
                parts.push(first);
            }
        }
        parts.extend(&lines[idx + 1..]);
        parts.join("\n").trim().to_string()
    } else if lines.iter().any(|line| is_marker_line(line)) {
        lines
            .iter()
            .filter(|line| !is_marker_line(line))
            .copied()
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    } else {
        raw.trim().to_string()
    }
}
