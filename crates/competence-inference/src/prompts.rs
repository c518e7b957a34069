//! Chat prompts for semantic segmentation and match reasoning.

use competence_core::{Alignment, ChatMessage};

fn splitter_instruction(symbol: &str) -> String {
    format!(
        "Segment the user's text (prose, bullet points or listings) into semantically \
independent groups.\n\
Never add, remove or modify words, and never add comments or explanations.\n\
Keep the original word order inside each group. Groups may be reordered, and related \
parts need not be adjacent in the input.\n\
Separate groups only by the delimiter\n{symbol}\n\
on a line of its own, with no surrounding whitespace.\n\
If the input is a single word, a single sentence or one coherent unit, return it verbatim \
without any delimiter. If unsure, return the whole input as one group. If the input is \
empty, return an empty string."
    )
}

/// Messages asking the model to split `text` into delimiter-separated groups.
pub fn semantic_splitter(symbol: &str, text: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(splitter_instruction(symbol)),
        ChatMessage::user(
            "The job requires welding experience. TIG welding is preferable. The cage is \
designed for small pets like rabbits, so it must not contain sharp edges. Experience with \
welding small wires could be beneficial.",
        ),
        ChatMessage::assistant(format!(
            "The job requires welding experience. TIG welding is preferable. Experience with \
welding small wires could be beneficial.\n{symbol}\nThe cage is designed for small pets like \
rabbits, so it must not contain sharp edges."
        )),
        ChatMessage::user(
            "- Assemble circuit boards according to schematic diagrams\n\
- Test each board for continuity and signal integrity\n\
- Package finished units in protective casing\n\
- Ship completed orders to customers worldwide",
        ),
        ChatMessage::assistant(format!(
            "- Assemble circuit boards according to schematic diagrams\n\
- Test each board for continuity and signal integrity\n{symbol}\n\
- Package finished units in protective casing\n\
- Ship completed orders to customers worldwide"
        )),
        ChatMessage::user("Operate the forklift in the warehouse."),
        ChatMessage::assistant("Operate the forklift in the warehouse."),
        ChatMessage::user(text),
    ]
}

const MATCH_REASON_INSTRUCTION: &str = "\
You explain how well a resource's competence suits a task.
You receive the task text, the competence text, a normalized similarity score between 0 and 1 \
and an alignment label (aligning, neutral or contradicting).
Score guide: 0 means not suited (contradicting or unrelated); up to 0.25 slightly suited; up to \
0.5 somewhat suited; up to 0.7 quite well suited; up to 0.85 very well suited; above 0.85 close \
to perfectly suited.
If the score and label disagree and the competence text clearly contradicts the task, follow \
the label and name the conflicting statements.
Answer with one to three short sentences. Be specific about the skill, tool, domain or \
limitation that explains the match.
Never mention the numeric score or the alignment label.";

fn reason_request(task: &str, competence: &str, score: f64, alignment: Alignment) -> String {
    format!(
        "Task: {}\nCompetence: {}\nSimilarity Score: {:.2}\nAlignment: {}",
        task, competence, score, alignment
    )
}

/// Messages asking the model to justify one match.
pub fn match_reason(
    task: &str,
    competence: &str,
    score: f64,
    alignment: Alignment,
) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(MATCH_REASON_INSTRUCTION),
        ChatMessage::user(reason_request(
            "Operate CNC milling machines to produce precision metal parts.",
            "Experience with CNC milling machines and precision machining.",
            0.91,
            Alignment::Aligning,
        )),
        ChatMessage::assistant(
            "The task requires operating CNC milling machines, which is exactly what the \
competence covers.",
        ),
        ChatMessage::user(reason_request(
            "Deliver packages on time while driving a delivery van through city traffic.",
            "Has no drivers license and cannot operate vehicles.",
            0.0,
            Alignment::Contradicting,
        )),
        ChatMessage::assistant(
            "The task requires driving a delivery van, but the competence states that the \
person cannot operate vehicles at all.",
        ),
        ChatMessage::user(reason_request(
            "Prepare raw materials for production.",
            "Experience with inventory management and supply chain logistics.",
            0.3,
            Alignment::Neutral,
        )),
        ChatMessage::assistant(
            "Inventory and logistics experience touches on material handling, but preparing raw \
materials is hands-on work the competence does not describe.",
        ),
        ChatMessage::user(reason_request(task, competence, score, alignment)),
    ]
}
