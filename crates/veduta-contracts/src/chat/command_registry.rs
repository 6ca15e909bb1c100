#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
}

pub(crate) const RAW_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "select",
        action: "select_style",
    },
    CommandSpec {
        command: "goto",
        action: "goto_position",
    },
    CommandSpec {
        command: "prompt",
        action: "prompt",
    },
];

pub(crate) const SINGLE_PATH_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "sketch",
        action: "attach_sketch",
    },
    CommandSpec {
        command: "upload",
        action: "upload_style",
    },
];

pub(crate) const NO_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "help",
        action: "help",
    },
    CommandSpec {
        command: "status",
        action: "status",
    },
    CommandSpec {
        command: "detach",
        action: "detach_sketch",
    },
    CommandSpec {
        command: "styles",
        action: "list_styles",
    },
    CommandSpec {
        command: "gallery",
        action: "show_gallery",
    },
    CommandSpec {
        command: "next",
        action: "gallery_next",
    },
    CommandSpec {
        command: "prev",
        action: "gallery_prev",
    },
    CommandSpec {
        command: "auto",
        action: "augment_prompt",
    },
    CommandSpec {
        command: "generate",
        action: "generate",
    },
    CommandSpec {
        command: "results",
        action: "show_results",
    },
    CommandSpec {
        command: "quit",
        action: "quit",
    },
];

pub(crate) const EXPORT_COMMAND: CommandSpec = CommandSpec {
    command: "export",
    action: "export",
};

pub const SESSION_HELP_COMMANDS: &[&str] = &[
    "/help",
    "/status",
    "/sketch",
    "/detach",
    "/styles",
    "/gallery",
    "/next",
    "/prev",
    "/goto",
    "/select",
    "/prompt",
    "/auto",
    "/upload",
    "/generate",
    "/results",
    "/export",
    "/quit",
];
