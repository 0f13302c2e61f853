use std::collections::HashSet;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use tracing::warn;

use quarrel_core::config::MalformedPolicy;
use quarrel_core::error::{QuarrelError, Result};

use super::step::{Sources, WorkflowStep};

const ARROW: &str = "->";

/// Outcome of parsing one line that contains an arrow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedLine {
    Step { line_no: usize, step: WorkflowStep },
    Malformed {
        line_no: usize,
        text: String,
        reason: String,
    },
}

/// `N` or `(N, N, ...)`. The list body is checked separately so errors can
/// name the offending token.
fn side_pattern() -> &'static Regex {
    static SIDE: OnceLock<Regex> = OnceLock::new();
    SIDE.get_or_init(|| Regex::new(r"^(?:(\d+)|\(([^()]*)\))$").expect("side pattern compiles"))
}

enum Side {
    User,
    Agents(Vec<usize>),
}

fn parse_number(token: &str) -> std::result::Result<usize, String> {
    let token = token.trim();
    if token.is_empty() {
        return Err("empty entry in agent list".to_string());
    }
    if !token.chars().all(|c| c.is_ascii_digit()) {
        return Err(format!("non-numeric token '{}'", token));
    }
    match token.parse::<usize>() {
        Ok(0) => Err("agent numbers start at 1".to_string()),
        Ok(n) => Ok(n - 1),
        Err(_) => Err(format!("agent number '{}' is too large", token)),
    }
}

fn parse_side(raw: &str) -> std::result::Result<Side, String> {
    let side = raw.trim();
    if side.is_empty() {
        return Err("missing agent list".to_string());
    }
    if side.eq_ignore_ascii_case("USER") {
        return Ok(Side::User);
    }

    let Some(caps) = side_pattern().captures(side) else {
        return if side.contains('(') || side.contains(')') {
            Err(format!("unbalanced parentheses in '{}'", side))
        } else {
            Err(format!("non-numeric token '{}'", side))
        };
    };

    if let Some(single) = caps.get(1) {
        return parse_number(single.as_str()).map(|i| Side::Agents(vec![i]));
    }

    let body = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
    if body.trim().is_empty() {
        return Err("empty agent list '()'".to_string());
    }
    body.split(',')
        .map(parse_number)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map(Side::Agents)
}

/// Parse a single WDL line. Returns `None` for lines without an arrow, which
/// are treated as prose and ignored.
pub fn parse_line(line_no: usize, raw: &str) -> Option<ParsedLine> {
    let text = raw.trim();
    if text.is_empty() || !text.contains(ARROW) {
        return None;
    }

    let malformed = |reason: String| ParsedLine::Malformed {
        line_no,
        text: text.to_string(),
        reason,
    };

    let parts: Vec<&str> = text.split(ARROW).collect();
    if parts.len() != 2 {
        return Some(malformed("more than one '->' on a line".to_string()));
    }

    let sources = match parse_side(parts[0]) {
        Ok(Side::User) => Sources::User,
        Ok(Side::Agents(indices)) => Sources::Agents(indices),
        Err(reason) => return Some(malformed(format!("left side: {}", reason))),
    };
    let targets = match parse_side(parts[1]) {
        Ok(Side::User) => return Some(malformed("USER cannot be a target".to_string())),
        Ok(Side::Agents(indices)) => indices,
        Err(reason) => return Some(malformed(format!("right side: {}", reason))),
    };

    Some(ParsedLine::Step {
        line_no,
        step: WorkflowStep { sources, targets },
    })
}

/// Parse every arrow line of a workflow description, in order.
pub fn parse_lines(text: &str) -> Vec<ParsedLine> {
    text.lines()
        .enumerate()
        .filter_map(|(i, line)| parse_line(i + 1, line))
        .collect()
}

/// Ordered list of steps, executed strictly in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepPlan {
    pub steps: Vec<WorkflowStep>,
}

impl StepPlan {
    pub fn new(steps: Vec<WorkflowStep>) -> Self {
        Self { steps }
    }

    /// Parse strictly: the first malformed line is an error.
    pub fn parse(text: &str) -> Result<Self> {
        Self::parse_with(text, MalformedPolicy::Fail)
    }

    /// Parse, handling malformed lines according to `policy`.
    pub fn parse_with(text: &str, policy: MalformedPolicy) -> Result<Self> {
        let mut steps = Vec::new();
        for parsed in parse_lines(text) {
            match parsed {
                ParsedLine::Step { step, .. } => steps.push(step),
                ParsedLine::Malformed {
                    line_no,
                    text,
                    reason,
                } => match policy {
                    MalformedPolicy::Fail => {
                        return Err(QuarrelError::Workflow {
                            line_no,
                            text,
                            reason,
                        });
                    }
                    MalformedPolicy::Skip => {
                        warn!(line_no, line = %text, reason = %reason, "Skipping malformed workflow line");
                    }
                },
            }
        }
        Ok(Self { steps })
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Check every referenced agent exists among `slot_count` slots.
    pub fn validate(&self, slot_count: usize) -> Result<()> {
        for (i, step) in self.steps.iter().enumerate() {
            let out_of_range = step
                .source_indices()
                .iter()
                .chain(step.targets.iter())
                .find(|&&idx| idx >= slot_count);
            if let Some(idx) = out_of_range {
                return Err(QuarrelError::Plan(format!(
                    "step {} ({}) references agent {} but only {} agents are configured",
                    i + 1,
                    step,
                    idx + 1,
                    slot_count
                )));
            }
        }
        Ok(())
    }

    /// Sources read before any earlier step targeted them, as
    /// `(step position, agent index)` pairs, 0-based.
    pub fn unproduced_sources(&self) -> Vec<(usize, usize)> {
        let mut produced = HashSet::new();
        let mut missing = Vec::new();
        for (i, step) in self.steps.iter().enumerate() {
            for &src in step.source_indices() {
                if !produced.contains(&src) {
                    missing.push((i, src));
                }
            }
            produced.extend(step.targets.iter().copied());
        }
        missing
    }
}

impl fmt::Display for StepPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, step) in self.steps.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", step)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_reference_workflow() {
        let plan = StepPlan::parse("USER -> 1\n1 -> (2,3)\n(2,3) -> 4").unwrap();
        assert_eq!(
            plan.steps,
            vec![
                WorkflowStep::from_user(vec![0]),
                WorkflowStep::from_agents(vec![0], vec![1, 2]),
                WorkflowStep::from_agents(vec![1, 2], vec![3]),
            ]
        );
    }

    #[test]
    fn rendered_plan_reparses_to_same_plan() {
        let text = "  USER->1\n\n1 -> ( 2 , 3 )\n(3,2) -> (4,1)\n4 -> 2";
        let plan = StepPlan::parse(text).unwrap();
        let rendered = plan.to_string();
        assert_eq!(rendered, "USER -> 1\n1 -> (2,3)\n(3,2) -> (4,1)\n4 -> 2");
        assert_eq!(StepPlan::parse(&rendered).unwrap(), plan);
    }

    #[test]
    fn keeps_order_and_duplicates() {
        let plan = StepPlan::parse("(3,1,3) -> (2,2)").unwrap();
        assert_eq!(plan.steps[0], WorkflowStep::from_agents(vec![2, 0, 2], vec![1, 1]));
    }

    #[test]
    fn lines_without_arrow_are_ignored() {
        let plan = StepPlan::parse("Debate workflow\nUSER -> 1\n# reviewers next\n1 -> 2").unwrap();
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn lowercase_user_accepted() {
        let plan = StepPlan::parse("user -> 2").unwrap();
        assert_eq!(plan.steps[0], WorkflowStep::from_user(vec![1]));
    }

    #[test]
    fn malformed_lines_are_tagged() {
        let cases = [
            ("1 -> x", "non-numeric"),
            ("-> 2", "missing agent list"),
            ("1 ->", "missing agent list"),
            ("0 -> 1", "start at 1"),
            ("1 -> USER", "cannot be a target"),
            ("(1,2 -> 3", "unbalanced"),
            ("() -> 3", "empty agent list"),
            ("(1,,2) -> 3", "empty entry"),
            ("1 -> 2 -> 3", "more than one"),
        ];
        for (line, expected) in cases {
            match parse_line(7, line) {
                Some(ParsedLine::Malformed {
                    line_no, reason, ..
                }) => {
                    assert_eq!(line_no, 7);
                    assert!(reason.contains(expected), "{line}: {reason}");
                }
                other => panic!("{line} should be malformed, got {other:?}"),
            }
        }
    }

    #[test]
    fn fail_policy_rejects_workflow() {
        let err = StepPlan::parse("USER -> 1\n1 -> two").unwrap_err();
        match err {
            QuarrelError::Workflow { line_no, text, .. } => {
                assert_eq!(line_no, 2);
                assert_eq!(text, "1 -> two");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn skip_policy_drops_bad_lines() {
        let plan =
            StepPlan::parse_with("USER -> 1\n1 -> two\n1 -> 2", MalformedPolicy::Skip).unwrap();
        assert_eq!(
            plan.steps,
            vec![
                WorkflowStep::from_user(vec![0]),
                WorkflowStep::from_agents(vec![0], vec![1]),
            ]
        );
    }

    #[test]
    fn validate_rejects_out_of_range_agents() {
        let plan = StepPlan::parse("USER -> 1\n1 -> 5").unwrap();
        assert!(plan.validate(5).is_ok());
        let err = plan.validate(4).unwrap_err();
        assert!(err.to_string().contains("agent 5"));
    }

    #[test]
    fn reports_sources_never_produced() {
        let plan = StepPlan::parse("USER -> 1\n(1,2) -> 3\n3 -> 4\n4 -> 1").unwrap();
        assert_eq!(plan.unproduced_sources(), vec![(1, 1)]);
    }

    #[test]
    fn empty_text_is_empty_plan() {
        let plan = StepPlan::parse("\n  \n").unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.to_string(), "");
    }
}
