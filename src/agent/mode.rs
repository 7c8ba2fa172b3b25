//! Modes: small configuration bundles naming the allowed observation types,
//! concept vocabulary, and prompt templates for a deployment.

use crate::memory::types::ObservationType;

/// A mode bundle, selected by the `mode` settings key.
#[derive(Debug, Clone)]
pub struct Mode {
    pub name: &'static str,
    pub allowed_types: Vec<ObservationType>,
    pub concepts: Vec<&'static str>,
    /// Template fragments injected into the init prompt.
    pub init_guidance: &'static str,
    pub observation_guidance: &'static str,
    pub summary_guidance: &'static str,
}

/// Look up a mode by name; unknown names fall back to `code`.
pub fn resolve_mode(name: &str) -> Mode {
    match name {
        "research" => research_mode(),
        _ => code_mode(),
    }
}

/// The default mode for coding sessions.
fn code_mode() -> Mode {
    Mode {
        name: "code",
        allowed_types: ObservationType::all().to_vec(),
        concepts: vec![
            "architecture",
            "build",
            "bug",
            "config",
            "database",
            "dependencies",
            "performance",
            "refactoring",
            "security",
            "testing",
            "tooling",
        ],
        init_guidance: "You observe a coding session and distill tool activity into \
                        structured observations. Report only what the events show; never \
                        invent files or commands.",
        observation_guidance: "Distill this tool event into zero or more <observation> \
                               blocks. Skip routine noise (directory listings, no-op reads).",
        summary_guidance: "Summarize the session so far in one <summary> block with \
                           request, investigated, learned, completed, next_steps, notes.",
    }
}

/// A narrower mode for research-style sessions: no code-change categories.
fn research_mode() -> Mode {
    Mode {
        name: "research",
        allowed_types: vec![ObservationType::Discovery, ObservationType::Decision],
        concepts: vec!["sources", "findings", "methodology", "open-questions"],
        init_guidance: "You observe a research session and record findings and decisions.",
        observation_guidance: "Distill this event into <observation> blocks of type \
                               discovery or decision only.",
        summary_guidance: "Summarize the research thread in one <summary> block.",
    }
}

impl Mode {
    /// Comma-separated type list for prompt interpolation.
    pub fn type_list(&self) -> String {
        self.allowed_types
            .iter()
            .map(|t| t.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// True when the agent may emit this observation type in this mode.
    pub fn allows(&self, ty: ObservationType) -> bool {
        self.allowed_types.contains(&ty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_mode_falls_back_to_code() {
        assert_eq!(resolve_mode("nonsense").name, "code");
        assert_eq!(resolve_mode("research").name, "research");
    }

    #[test]
    fn research_mode_restricts_types() {
        let mode = resolve_mode("research");
        assert!(mode.allows(ObservationType::Discovery));
        assert!(!mode.allows(ObservationType::Bugfix));
    }
}
