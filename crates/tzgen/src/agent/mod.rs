use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// The four drafting stages, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Description,
    Goals,
    Users,
    Requirements,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::Description,
        Stage::Goals,
        Stage::Users,
        Stage::Requirements,
    ];

    pub fn from_id(id: i64) -> Result<Self, PipelineError> {
        match id {
            1 => Ok(Self::Description),
            2 => Ok(Self::Goals),
            3 => Ok(Self::Users),
            4 => Ok(Self::Requirements),
            other => Err(PipelineError::UnknownStage(other)),
        }
    }

    pub fn id(self) -> u8 {
        match self {
            Self::Description => 1,
            Self::Goals => 2,
            Self::Users => 3,
            Self::Requirements => 4,
        }
    }

    pub fn key(self) -> &'static str {
        match self {
            Self::Description => "description",
            Self::Goals => "goals",
            Self::Users => "users",
            Self::Requirements => "requirements",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Self::Description => "Project description",
            Self::Goals => "Goals and objectives",
            Self::Users => "User groups and roles",
            Self::Requirements => "Requirements and functionality",
        }
    }

    pub fn previous(self) -> Option<Self> {
        match self {
            Self::Description => None,
            Self::Goals => Some(Self::Description),
            Self::Users => Some(Self::Goals),
            Self::Requirements => Some(Self::Users),
        }
    }

    fn instructions(self) -> &'static str {
        match self {
            Self::Description => {
                "You are a professional analyst. From the user's input prepare a short but structured project description covering:\n\
                 1. Project name (if any)\n\
                 2. Overall purpose of the project\n\
                 3. The problem being solved\n\
                 4. Target audience\n\
                 5. Context and motivation for the work\n\
                 6. Planned interaction with other systems, if applicable\n\
                 7. Glossary of terms and abbreviations mentioned in the text\n\
                 Update the description taking the user's comments into account."
            }
            Self::Goals => {
                "You are a business requirements analyst. Refine the project goals from the input and structure them as:\n\
                 1. Business goals\n\
                 2. User goals\n\
                 3. How achieving these goals moves business metrics\n\
                 4. Kind of work: greenfield, extension, migration, etc.\n\
                 Apply the user's corrections when updating the goals."
            }
            Self::Users => {
                "You are a systems analyst. From the input determine:\n\
                 1. Main user groups (customers, staff, administrators, ...)\n\
                 2. Roles and access levels\n\
                 3. Use cases\n\
                 4. User actions and interaction with the system\n\
                 Update the section taking the comments into account."
            }
            Self::Requirements => {
                "You are a requirements engineer. Extract and structure from the text:\n\
                 1. Functional requirements\n\
                 2. Non-functional requirements\n\
                 3. Interface requirements\n\
                 4. Integration requirements\n\
                 5. Security requirements\n\
                 6. Quality and reliability requirements\n\
                 7. Development requirements\n\
                 8. User scenarios\n\
                 Update the requirement list from the input and the comments."
            }
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Joins the seed text and the user's comment into the prompt input.
pub fn merge_input(previous: &str, comment: &str) -> String {
    let previous = previous.trim();
    let comment = comment.trim();
    if previous.is_empty() {
        format!("User comment:\n{comment}")
    } else {
        format!("{previous}\n\nUser comment:\n{comment}")
    }
}

pub fn build_prompt(stage: Stage, previous: &str, comment: &str) -> String {
    format!(
        "# Phase: SECTION\nStage: {}\nSection: {}\n{}\n\nInput:\n{}\nEnd of input.\n\nReply with ONLY the finished section, without instructions, hints or comments.",
        stage.key(),
        stage.title(),
        stage.instructions(),
        merge_input(previous, comment),
    )
}

pub fn clarify_prompt(stage: Stage, previous: &str, comment: &str) -> String {
    format!(
        "# Phase: CLARIFY\nStage: {}\nSection: {}\nYou are an expert on the \"{}\" section. Below is the previous text (if any) and the user's input.\n1) If there is not enough information for a complete section, ask exactly one clarifying question ending with a question mark.\n2) Otherwise write the section right away following these instructions:\n{}\n\nInput:\n{}\nEnd of input.",
        stage.key(),
        stage.title(),
        stage.title(),
        stage.instructions(),
        merge_input(previous, comment),
    )
}

/// A reply ending in a question mark asks the user for more detail.
pub fn is_clarification(reply: &str) -> bool {
    reply.trim_end().ends_with('?')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_ids_round_trip_in_order() {
        for (index, stage) in Stage::ALL.iter().enumerate() {
            assert_eq!(stage.id() as usize, index + 1);
            assert_eq!(Stage::from_id(stage.id() as i64).unwrap(), *stage);
        }
        assert!(matches!(
            Stage::from_id(5),
            Err(PipelineError::UnknownStage(5))
        ));
        assert!(Stage::from_id(0).is_err());
    }

    #[test]
    fn previous_stage_chain_is_linear() {
        assert_eq!(Stage::Description.previous(), None);
        assert_eq!(Stage::Requirements.previous(), Some(Stage::Users));
    }

    #[test]
    fn merge_input_omits_empty_previous() {
        assert_eq!(merge_input("  ", " shop "), "User comment:\nshop");
        assert_eq!(
            merge_input("Draft\n", "add payments"),
            "Draft\n\nUser comment:\nadd payments"
        );
    }

    #[test]
    fn section_prompt_carries_markers_and_input() {
        let prompt = build_prompt(Stage::Goals, "Old goals", "Focus on B2B");
        assert!(prompt.starts_with("# Phase: SECTION\nStage: goals\nSection: Goals and objectives"));
        assert!(prompt.contains("Input:\nOld goals\n\nUser comment:\nFocus on B2B\nEnd of input."));
        assert!(prompt.contains("Business goals"));
    }

    #[test]
    fn clarify_prompt_mentions_question_rule() {
        let prompt = clarify_prompt(Stage::Users, "", "admins and clients");
        assert!(prompt.starts_with("# Phase: CLARIFY"));
        assert!(prompt.contains("ask exactly one clarifying question"));
        assert!(prompt.contains("User comment:\nadmins and clients"));
    }

    #[test]
    fn clarification_detection_ignores_trailing_whitespace() {
        assert!(is_clarification("Who are the users?\n"));
        assert!(!is_clarification("Users: admins."));
    }
}
