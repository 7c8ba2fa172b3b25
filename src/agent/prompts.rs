//! Prompt builders for the three turn kinds: init, observation, summarize.

use chrono::{TimeZone, Utc};

use crate::agent::mode::Mode;

/// First user turn of a memory session: project, session identity, the
/// user's initial prompt, and the active mode's rules.
pub fn build_init_prompt(
    mode: &Mode,
    project: &str,
    content_session_id: &str,
    initial_prompt: Option<&str>,
) -> String {
    let mut out = String::new();
    out.push_str(mode.init_guidance);
    out.push_str("\n\n");
    out.push_str(&format!("Project: {project}\n"));
    out.push_str(&format!("Session: {content_session_id}\n"));
    if let Some(prompt) = initial_prompt {
        out.push_str(&format!("The user opened the session with:\n{prompt}\n"));
    }
    out.push_str(&format!(
        "\nAllowed observation types: {}.\n",
        mode.type_list()
    ));
    out.push_str(&format!(
        "Preferred concept tags: {}.\n",
        mode.concepts.join(", ")
    ));
    out.push_str(
        "\nRespond to each event with <observation> blocks:\n\
         <observation>\n\
         <type>discovery</type>\n\
         <title>…</title>\n\
         <subtitle>…</subtitle>\n\
         <narrative>…</narrative>\n\
         <fact>…</fact>\n\
         <concept>…</concept>\n\
         <file_read>…</file_read>\n\
         <file_modified>…</file_modified>\n\
         </observation>\n",
    );
    out
}

/// One tool-use event, with its original wall-clock time so the model can
/// narrate in order even when processing lags.
pub fn build_observation_prompt(
    mode: &Mode,
    tool_name: &str,
    tool_input: &serde_json::Value,
    tool_response: &str,
    cwd: Option<&str>,
    event_epoch_ms: i64,
) -> String {
    let when = Utc
        .timestamp_millis_opt(event_epoch_ms)
        .single()
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| event_epoch_ms.to_string());

    let mut out = String::new();
    out.push_str(mode.observation_guidance);
    out.push_str("\n\n");
    out.push_str(&format!("Tool: {tool_name}\n"));
    out.push_str(&format!("At: {when}\n"));
    if let Some(dir) = cwd {
        out.push_str(&format!("Working directory: {dir}\n"));
    }
    if !tool_input.is_null() {
        out.push_str(&format!("Input: {tool_input}\n"));
    }
    out.push_str("Response:\n");
    out.push_str(tool_response);
    out.push('\n');
    out
}

/// End-of-turn summarize prompt seeded with the last assistant transcript
/// message (when the host supplied one).
pub fn build_summary_prompt(mode: &Mode, last_assistant_message: Option<&str>) -> String {
    let mut out = String::new();
    out.push_str(mode.summary_guidance);
    out.push_str("\n\n");
    if let Some(msg) = last_assistant_message {
        out.push_str("The assistant's final message this turn was:\n");
        out.push_str(msg);
        out.push('\n');
    }
    out.push_str(
        "\nFormat:\n\
         <summary>\n\
         <request>…</request>\n\
         <investigated>…</investigated>\n\
         <learned>…</learned>\n\
         <completed>…</completed>\n\
         <next_steps>…</next_steps>\n\
         <notes>…</notes>\n\
         </summary>\n",
    );
    out
}
