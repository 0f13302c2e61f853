use std::fmt;

/// Where a step's context comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sources {
    /// The run's initial task.
    User,
    /// Outputs of these agents (0-based), aggregated in this order.
    Agents(Vec<usize>),
}

/// One edge group of the workflow: context from `sources` is sent to every
/// agent in `targets` concurrently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowStep {
    pub sources: Sources,
    /// Never empty. 0-based agent indices in dispatch order.
    pub targets: Vec<usize>,
}

impl WorkflowStep {
    pub fn from_user(targets: Vec<usize>) -> Self {
        Self {
            sources: Sources::User,
            targets,
        }
    }

    pub fn from_agents(sources: Vec<usize>, targets: Vec<usize>) -> Self {
        Self {
            sources: Sources::Agents(sources),
            targets,
        }
    }

    /// Agent indices this step reads from (empty for `USER`).
    pub fn source_indices(&self) -> &[usize] {
        match self.sources {
            Sources::User => &[],
            Sources::Agents(ref indices) => indices,
        }
    }
}

/// Render 0-based indices in WDL surface syntax: `3` or `(2,3)`.
fn write_indices(f: &mut fmt::Formatter<'_>, indices: &[usize]) -> fmt::Result {
    match indices {
        [single] => write!(f, "{}", single + 1),
        many => {
            let joined = many
                .iter()
                .map(|i| (i + 1).to_string())
                .collect::<Vec<_>>()
                .join(",");
            write!(f, "({})", joined)
        }
    }
}

impl fmt::Display for Sources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "USER"),
            Self::Agents(indices) => write_indices(f, indices),
        }
    }
}

impl fmt::Display for WorkflowStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> ", self.sources)?;
        write_indices(f, &self.targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_surface_syntax() {
        assert_eq!(WorkflowStep::from_user(vec![0]).to_string(), "USER -> 1");
        assert_eq!(
            WorkflowStep::from_agents(vec![0], vec![1, 2]).to_string(),
            "1 -> (2,3)"
        );
        assert_eq!(
            WorkflowStep::from_agents(vec![1, 2], vec![3]).to_string(),
            "(2,3) -> 4"
        );
    }

    #[test]
    fn source_indices() {
        assert!(WorkflowStep::from_user(vec![0]).source_indices().is_empty());
        assert_eq!(
            WorkflowStep::from_agents(vec![2, 0], vec![1]).source_indices(),
            &[2, 0]
        );
    }
}
