use std::collections::BTreeMap;

use serde_json::Value;

use super::command_registry::{
    CommandSpec, EXPORT_COMMAND, NO_ARG_COMMANDS, RAW_ARG_COMMANDS, SINGLE_PATH_COMMANDS,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Intent {
    pub action: String,
    pub raw: String,
    pub prompt: Option<String>,
    pub command_args: BTreeMap<String, Value>,
}

impl Intent {
    fn new(action: &str, raw: &str) -> Self {
        Self {
            action: action.to_string(),
            raw: raw.to_string(),
            prompt: None,
            command_args: BTreeMap::new(),
        }
    }
}

fn find_action(command: &str, specs: &[CommandSpec]) -> Option<&'static str> {
    specs
        .iter()
        .find(|spec| spec.command == command)
        .map(|spec| spec.action)
}

fn parse_path_args(arg: &str) -> Vec<String> {
    if arg.trim().is_empty() {
        return Vec::new();
    }
    match shell_words::split(arg) {
        Ok(parts) => parts
            .into_iter()
            .filter(|value| !value.is_empty())
            .collect(),
        Err(_) => arg
            .split_whitespace()
            .map(str::to_string)
            .filter(|value| !value.is_empty())
            .collect(),
    }
}

fn parse_single_path_arg(arg: &str) -> String {
    let parts = parse_path_args(arg);
    match parts.len() {
        0 => String::new(),
        1 => parts[0].clone(),
        _ => parts.join(" "),
    }
}

pub fn parse_intent(text: &str) -> Intent {
    let raw_trimmed = text.trim();
    if raw_trimmed.is_empty() {
        return Intent::new("noop", text);
    }

    if let Some(slash_tail) = raw_trimmed.strip_prefix('/') {
        let command_len = slash_tail
            .chars()
            .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
            .count();
        if command_len > 0 {
            let command = slash_tail[..command_len].to_ascii_lowercase();
            let remainder = &slash_tail[command_len..];
            let arg = if remainder.is_empty() {
                ""
            } else {
                remainder.trim()
            };

            if let Some(action) = find_action(&command, RAW_ARG_COMMANDS) {
                let key = match action {
                    "select_style" => "style",
                    "goto_position" => "position",
                    _ => "text",
                };
                let mut intent = Intent::new(action, text);
                intent
                    .command_args
                    .insert(key.to_string(), Value::String(arg.to_string()));
                return intent;
            }

            if let Some(action) = find_action(&command, SINGLE_PATH_COMMANDS) {
                let mut intent = Intent::new(action, text);
                intent.command_args.insert(
                    "path".to_string(),
                    Value::String(parse_single_path_arg(arg)),
                );
                return intent;
            }

            if let Some(action) = find_action(&command, NO_ARG_COMMANDS) {
                return Intent::new(action, text);
            }

            if command == EXPORT_COMMAND.command {
                let mut intent = Intent::new(EXPORT_COMMAND.action, text);
                intent.command_args.insert(
                    "dir".to_string(),
                    Value::String(if arg.is_empty() {
                        "renders".to_string()
                    } else {
                        parse_single_path_arg(arg)
                    }),
                );
                return intent;
            }

            let mut intent = Intent::new("unknown", text);
            intent
                .command_args
                .insert("command".to_string(), Value::String(command));
            intent
                .command_args
                .insert("arg".to_string(), Value::String(arg.to_string()));
            return intent;
        }
    }

    let mut intent = Intent::new("set_prompt", text);
    intent.prompt = Some(raw_trimmed.to_string());
    intent
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::parse_intent;

    #[test]
    fn parse_sketch_with_quoted_path() {
        let intent = parse_intent("/sketch \"/tmp/front elevation.png\"");
        assert_eq!(intent.action, "attach_sketch");
        assert_eq!(intent.command_args["path"], json!("/tmp/front elevation.png"));
    }

    #[test]
    fn parse_upload_path() {
        let intent = parse_intent("/upload styles/brutalist.png");
        assert_eq!(intent.action, "upload_style");
        assert_eq!(intent.command_args["path"], json!("styles/brutalist.png"));
    }

    #[test]
    fn parse_select_keeps_raw_reference() {
        let intent = parse_intent("/select gothic.png");
        assert_eq!(intent.action, "select_style");
        assert_eq!(intent.command_args["style"], json!("gothic.png"));

        let by_index = parse_intent("/select 2");
        assert_eq!(by_index.command_args["style"], json!("2"));
    }

    #[test]
    fn parse_goto_position() {
        let intent = parse_intent("/goto 3");
        assert_eq!(intent.action, "goto_position");
        assert_eq!(intent.command_args["position"], json!("3"));
    }

    #[test]
    fn parse_prompt_command_with_and_without_text() {
        let set = parse_intent("/prompt winter courtyard at dusk");
        assert_eq!(set.action, "prompt");
        assert_eq!(set.command_args["text"], json!("winter courtyard at dusk"));

        let show = parse_intent("/prompt");
        assert_eq!(show.action, "prompt");
        assert_eq!(show.command_args["text"], json!(""));
    }

    #[test]
    fn parse_no_arg_commands() {
        assert_eq!(parse_intent("/help").action, "help");
        assert_eq!(parse_intent("/status").action, "status");
        assert_eq!(parse_intent("/detach").action, "detach_sketch");
        assert_eq!(parse_intent("/styles").action, "list_styles");
        assert_eq!(parse_intent("/gallery").action, "show_gallery");
        assert_eq!(parse_intent("/next").action, "gallery_next");
        assert_eq!(parse_intent("/prev").action, "gallery_prev");
        assert_eq!(parse_intent("/auto").action, "augment_prompt");
        assert_eq!(parse_intent("/generate").action, "generate");
        assert_eq!(parse_intent("/results").action, "show_results");
        assert_eq!(parse_intent("/quit").action, "quit");
    }

    #[test]
    fn parse_export_defaults_directory() {
        let default = parse_intent("/export");
        assert_eq!(default.action, "export");
        assert_eq!(default.command_args["dir"], json!("renders"));

        let explicit = parse_intent("/export \"/tmp/out dir\"");
        assert_eq!(explicit.command_args["dir"], json!("/tmp/out dir"));
    }

    #[test]
    fn commands_are_case_insensitive() {
        assert_eq!(parse_intent("/GENERATE").action, "generate");
        assert_eq!(parse_intent("/Sketch a.png").action, "attach_sketch");
    }

    #[test]
    fn parse_unknown_command() {
        let intent = parse_intent("/magic foo bar");
        assert_eq!(intent.action, "unknown");
        assert_eq!(intent.command_args["command"], json!("magic"));
        assert_eq!(intent.command_args["arg"], json!("foo bar"));
    }

    #[test]
    fn bare_text_sets_the_prompt() {
        let intent = parse_intent("  red brick facade with arched windows  ");
        assert_eq!(intent.action, "set_prompt");
        assert_eq!(
            intent.prompt.as_deref(),
            Some("red brick facade with arched windows")
        );
    }

    #[test]
    fn empty_input_is_noop() {
        assert_eq!(parse_intent("   ").action, "noop");
        assert_eq!(parse_intent("").action, "noop");
    }
}
