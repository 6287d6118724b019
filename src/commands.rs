use anyhow::bail;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::chat::ChatSender;
use crate::config::Config;
use crate::error::AppError;
use crate::models::{Advertisement, CommandAdvert, ExtendedDescription, InboundMessage};
use crate::registry::Registry;
use crate::template::{Template, TemplateError};

const MAX_NAME_LEN: usize = 100;

const CREATE_USAGE: &str = "create <name> [<template>]";
const UPDATE_USAGE: &str = "update <name> [<template>]";
const REMOVE_USAGE: &str = "remove <name>";
const LIST_USAGE: &str = "list";
const HELP_USAGE: &str = "help";

#[derive(Debug, PartialEq, Eq)]
pub enum Command<'a> {
    Create { name: &'a str, template: &'a str },
    Update { name: &'a str, template: &'a str },
    Remove { name: &'a str },
    List,
    Help,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    /// Wrong arguments for a known subcommand; carries its usage line.
    Usage(&'static str),
    NameTooLong,
    UnknownSubcommand,
}

/// Splits off the first word and drops the whitespace run after it. The
/// remainder is returned untouched.
fn split_word(input: &str) -> (&str, &str) {
    match input.find(char::is_whitespace) {
        Some(i) => (&input[..i], input[i..].trim_start()),
        None => (input, ""),
    }
}

fn check_name(name: &str, usage: &'static str) -> Result<(), ParseError> {
    if name.is_empty() {
        return Err(ParseError::Usage(usage));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(ParseError::NameTooLong);
    }
    Ok(())
}

/// Parses a chat message. `None` means the message is not addressed to us.
pub fn parse<'a>(prefix: &str, body: &'a str) -> Option<Result<Command<'a>, ParseError>> {
    let rest = body.trim_start().strip_prefix(prefix)?;
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let (sub, args) = split_word(rest.trim_start());

    let command = match sub {
        "create" | "update" => {
            let usage = if sub == "create" { CREATE_USAGE } else { UPDATE_USAGE };
            let (name, template) = split_word(args);
            check_name(name, usage).map(|()| {
                if sub == "create" {
                    Command::Create { name, template }
                } else {
                    Command::Update { name, template }
                }
            })
        }
        "remove" => {
            let (name, extra) = split_word(args);
            check_name(name, REMOVE_USAGE).and_then(|()| {
                if extra.is_empty() {
                    Ok(Command::Remove { name })
                } else {
                    Err(ParseError::Usage(REMOVE_USAGE))
                }
            })
        }
        "list" if args.is_empty() => Ok(Command::List),
        "list" => Err(ParseError::Usage(LIST_USAGE)),
        "help" if args.is_empty() => Ok(Command::Help),
        "help" => Err(ParseError::Usage(HELP_USAGE)),
        _ => Err(ParseError::UnknownSubcommand),
    };
    Some(command)
}

const CREATE_EXTENDED: &str = "Create a new webhook for sending messages into the current \
conversation. You must supply a name as well to identify the webhook. To use a webhook URL, \
supply a `msg` URL parameter, or a JSON POST body with a field `msg`. You can also supply a \
template, which allows you to customize the message displayed by the webhook, and the URL \
and/or JSON fields it will accept. For more information on templates, use the \
`!webhook help` command.

Example:```
    !webhook create alerts```

Example (using custom template):```
    !webhook create alerts *{{.title}}*
    `{{.body}}````";

const UPDATE_EXTENDED: &str = "Update an existing webhook's template. Leave the template \
field empty to use the default template. For more information on templates, use the \
`!webhook help` command.

Example:```
    !webhook update alerts *New Alert: {{.title}}*
    `{{.body}}````";

const REMOVE_EXTENDED: &str = "Remove a webhook from the current conversation. You must \
supply the name of the webhook.

Example:```
    !webhook remove alerts```";

/// Commands published to the chat service at startup.
pub fn advertisement() -> Advertisement {
    Advertisement {
        alias: "Webhooks",
        commands: vec![
            CommandAdvert {
                name: "webhook create",
                usage: "<name> [<template>]",
                description: "Create a new webhook for sending into the current conversation",
                extended: Some(ExtendedDescription {
                    title: "*!webhook create* <name> [<template>]\nCreate a webhook",
                    body: CREATE_EXTENDED,
                }),
            },
            CommandAdvert {
                name: "webhook update",
                usage: "<name> [<template>]",
                description: "Update the template of an existing webhook in the current conversation",
                extended: Some(ExtendedDescription {
                    title: "*!webhook update* <name> [<template>]\nUpdate a webhook's template",
                    body: UPDATE_EXTENDED,
                }),
            },
            CommandAdvert {
                name: "webhook list",
                usage: "",
                description: "List active webhooks in the current conversation",
                extended: None,
            },
            CommandAdvert {
                name: "webhook remove",
                usage: "<name>",
                description: "Remove a webhook from the current conversation",
                extended: Some(ExtendedDescription {
                    title: "*!webhook remove* <name>\nRemove a webhook",
                    body: REMOVE_EXTENDED,
                }),
            },
            CommandAdvert {
                name: "webhook help",
                usage: "",
                description: "Get more information about using templates",
                extended: None,
            },
        ],
    }
}

fn help_text(prefix: &str) -> String {
    format!(
        "Webhooks post into this conversation whenever something calls their URL.\n\
         \n\
         Without a template, the message is the `msg` URL parameter or JSON field; \
         any other fields are listed as `key: value` lines.\n\
         \n\
         A template formats whatever fields the caller sends:\n\
         • `{{{{.title}}}}` inserts a field, `{{{{.alert.host}}}}` a nested one\n\
         • `{{{{if .failed}}}}…{{{{else}}}}…{{{{end}}}}` picks text by whether a field is set\n\
         • `{{{{range .commits}}}}- {{{{.message}}}}\\n{{{{end}}}}` repeats text for each element\n\
         • `{{{{with .build}}}}#{{{{.number}}}}{{{{end}}}}` narrows to one field\n\
         • `{{{{/* comment */}}}}` is ignored, `{{{{-` and `-}}}}` trim surrounding whitespace\n\
         Missing fields render as nothing.\n\
         \n\
         Example:\n\
         ```\n\
         {prefix} create alerts *{{{{.title}}}}*\n\
         {{{{.body}}}}\n\
         ```\n\
         then POST `{{\"title\": \"Disk full\", \"body\": \"db1 is at 98%\"}}` to the URL."
    )
}

/// Applies chat commands to the registry and answers in the conversation.
pub struct CommandHandler {
    registry: Arc<Registry>,
    chat: Arc<dyn ChatSender>,
    config: Arc<Config>,
}

impl CommandHandler {
    pub fn new(registry: Arc<Registry>, chat: Arc<dyn ChatSender>, config: Arc<Config>) -> Self {
        Self {
            registry,
            chat,
            config,
        }
    }

    /// Handles one inbound message. Only storage failures are returned; every
    /// other problem becomes a reply.
    pub async fn handle(&self, message: &InboundMessage) -> Result<(), AppError> {
        if self.config.bot_username.as_deref() == Some(message.sender.as_str()) {
            return Ok(());
        }
        let Some(parsed) = parse(&self.config.command_prefix, &message.body) else {
            return Ok(());
        };
        let conv = message.conversation_id.as_str();

        let outcome = match parsed {
            Ok(command) => self.execute(conv, command).await,
            Err(e) => Ok(self.usage_reply(e)),
        };

        match outcome {
            Ok(reply) => {
                self.reply(conv, &reply).await;
                Ok(())
            }
            Err(e) => {
                self.reply(conv, "Something went wrong on my end, please try again later.")
                    .await;
                Err(e)
            }
        }
    }

    async fn execute(&self, conv: &str, command: Command<'_>) -> Result<String, AppError> {
        match command {
            Command::Create { name, template } => {
                if let Err(e) = validate(template) {
                    return Ok(template_rejected(&e));
                }
                match self.registry.create(conv, name, Some(template)).await {
                    Ok(token) => {
                        info!(conversation_id = %conv, name, "Created webhook");
                        Ok(format!(
                            "Success! New URL: {}\nAnyone with this URL can post here, so share it carefully.",
                            self.config.callback_url(&token)
                        ))
                    }
                    Err(AppError::Conflict(_)) => Ok(format!(
                        "A webhook named `{name}` already exists in this conversation."
                    )),
                    Err(e) => Err(e),
                }
            }
            Command::Update { name, template } => {
                if let Err(e) = validate(template) {
                    return Ok(template_rejected(&e));
                }
                match self.registry.update_template(conv, name, Some(template)).await {
                    Ok(()) => {
                        info!(conversation_id = %conv, name, "Updated webhook template");
                        Ok(format!("Success! Webhook `{name}` updated."))
                    }
                    Err(e) if e.is_not_found() => Ok(no_such_webhook(name)),
                    Err(e) => Err(e),
                }
            }
            Command::Remove { name } => match self.registry.remove(conv, name).await {
                Ok(()) => {
                    info!(conversation_id = %conv, name, "Removed webhook");
                    Ok(format!(
                        "Success! Webhook `{name}` removed; its URL no longer accepts messages."
                    ))
                }
                Err(e) if e.is_not_found() => Ok(no_such_webhook(name)),
                Err(e) => Err(e),
            },
            Command::List => {
                let hooks = self.registry.list(conv).await?;
                if hooks.is_empty() {
                    return Ok(format!(
                        "There are no webhooks in this conversation. Create one with `{} {CREATE_USAGE}`.",
                        self.config.command_prefix
                    ));
                }
                let lines: Vec<String> = hooks
                    .iter()
                    .map(|hook| {
                        let created = hook.created_at.format("%Y-%m-%d");
                        if hook.has_template {
                            format!("• {} (custom template, created {created})", hook.name)
                        } else {
                            format!("• {} (created {created})", hook.name)
                        }
                    })
                    .collect();
                Ok(format!(
                    "Webhooks in this conversation:\n{}",
                    lines.join("\n")
                ))
            }
            Command::Help => Ok(help_text(&self.config.command_prefix)),
        }
    }

    fn usage_reply(&self, error: ParseError) -> String {
        let prefix = &self.config.command_prefix;
        match error {
            ParseError::Usage(usage) => format!("Usage: `{prefix} {usage}`"),
            ParseError::NameTooLong => {
                format!("Webhook names can be at most {MAX_NAME_LEN} characters.")
            }
            ParseError::UnknownSubcommand => format!(
                "Unknown command. Available: `{prefix} {CREATE_USAGE}`, `{prefix} {UPDATE_USAGE}`, \
                 `{prefix} {REMOVE_USAGE}`, `{prefix} {LIST_USAGE}`, `{prefix} {HELP_USAGE}`"
            ),
        }
    }

    async fn reply(&self, conv: &str, text: &str) {
        if let Err(e) = self.chat.send_message(conv, text).await {
            warn!(conversation_id = %conv, "Failed to send command reply: {e}");
        }
    }
}

fn validate(template: &str) -> Result<(), TemplateError> {
    if !template.trim().is_empty() {
        Template::parse(template)?;
    }
    Ok(())
}

fn template_rejected(error: &TemplateError) -> String {
    format!("That template has a syntax error ({error}); nothing was saved.")
}

fn no_such_webhook(name: &str) -> String {
    format!("No webhook named `{name}` exists in this conversation.")
}

/// Feeds inbound chat messages to the handler until cancelled.
pub async fn listen(
    handler: CommandHandler,
    mut inbound: mpsc::Receiver<InboundMessage>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            message = inbound.recv() => message,
        };
        let Some(message) = message else {
            bail!("chat event stream ended");
        };
        handler.handle(&message).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::testing::RecordingChat;
    use crate::registry::testing::temp_registry;
    use tempfile::TempDir;

    #[test]
    fn parses_each_subcommand() {
        assert_eq!(
            parse("!webhook", "!webhook create alerts"),
            Some(Ok(Command::Create {
                name: "alerts",
                template: ""
            }))
        );
        assert_eq!(
            parse("!webhook", "!webhook   update  ci {{.a}}"),
            Some(Ok(Command::Update {
                name: "ci",
                template: "{{.a}}"
            }))
        );
        assert_eq!(
            parse("!webhook", "!webhook remove ci"),
            Some(Ok(Command::Remove { name: "ci" }))
        );
        assert_eq!(parse("!webhook", "!webhook list"), Some(Ok(Command::List)));
        assert_eq!(parse("!webhook", "!webhook help"), Some(Ok(Command::Help)));
    }

    #[test]
    fn template_text_is_kept_verbatim() {
        let body = "!webhook create alerts *{{.title}}*\n  {{.body}}  ";
        assert_eq!(
            parse("!webhook", body),
            Some(Ok(Command::Create {
                name: "alerts",
                template: "*{{.title}}*\n  {{.body}}  "
            }))
        );
    }

    #[test]
    fn ignores_messages_for_someone_else() {
        assert_eq!(parse("!webhook", "hello there"), None);
        assert_eq!(parse("!webhook", "!webhooks list"), None);
    }

    #[test]
    fn malformed_commands_are_usage_errors() {
        assert_eq!(
            parse("!webhook", "!webhook create"),
            Some(Err(ParseError::Usage(CREATE_USAGE)))
        );
        assert_eq!(
            parse("!webhook", "!webhook remove a b"),
            Some(Err(ParseError::Usage(REMOVE_USAGE)))
        );
        assert_eq!(
            parse("!webhook", "!webhook list please"),
            Some(Err(ParseError::Usage(LIST_USAGE)))
        );
        assert_eq!(
            parse("!webhook", "!webhook"),
            Some(Err(ParseError::UnknownSubcommand))
        );
        assert_eq!(
            parse("!webhook", "!webhook frobnicate"),
            Some(Err(ParseError::UnknownSubcommand))
        );
        let long = format!("!webhook create {}", "n".repeat(MAX_NAME_LEN + 1));
        assert_eq!(parse("!webhook", &long), Some(Err(ParseError::NameTooLong)));
    }

    struct Fixture {
        handler: CommandHandler,
        registry: Arc<Registry>,
        chat: Arc<RecordingChat>,
        _dir: TempDir,
    }

    async fn fixture() -> Fixture {
        let (registry, dir) = temp_registry().await;
        let registry = Arc::new(registry);
        let chat = Arc::new(RecordingChat::default());
        let config = Arc::new(Config::for_test("https://bots.example.com/webhookbot"));
        Fixture {
            handler: CommandHandler::new(registry.clone(), chat.clone(), config),
            registry,
            chat,
            _dir: dir,
        }
    }

    impl Fixture {
        async fn say(&self, conv: &str, body: &str) -> String {
            let message = InboundMessage {
                conversation_id: conv.to_string(),
                sender: "ann".to_string(),
                body: body.to_string(),
            };
            self.handler.handle(&message).await.unwrap();
            self.chat.last_to(conv).unwrap()
        }
    }

    #[tokio::test]
    async fn create_replies_with_callback_url() {
        let f = fixture().await;
        let reply = f.say("conv", "!webhook create alerts {{.title}}").await;

        let url = reply
            .lines()
            .next()
            .and_then(|line| line.strip_prefix("Success! New URL: "))
            .unwrap();
        let token = url
            .strip_prefix("https://bots.example.com/webhookbot/")
            .unwrap();
        let hook = f.registry.resolve(token).await.unwrap();
        assert_eq!(hook.name, "alerts");
        assert_eq!(hook.template.as_deref(), Some("{{.title}}"));
    }

    #[tokio::test]
    async fn duplicate_create_is_refused() {
        let f = fixture().await;
        f.say("conv", "!webhook create alerts").await;
        let reply = f.say("conv", "!webhook create alerts").await;
        assert!(reply.contains("already exists"));
        assert_eq!(f.registry.list("conv").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn malformed_template_creates_nothing() {
        let f = fixture().await;
        let reply = f.say("conv", "!webhook create alerts *{{.title").await;
        assert!(reply.contains("syntax error"));
        assert!(f.registry.list("conv").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_validates_and_reports_missing_names() {
        let f = fixture().await;
        f.say("conv", "!webhook create ci").await;

        let reply = f.say("conv", "!webhook update ci {{if .x}}").await;
        assert!(reply.contains("syntax error"));
        let reply = f.say("conv", "!webhook update nope {{.x}}").await;
        assert!(reply.contains("No webhook named `nope`"));
        let reply = f.say("conv", "!webhook update ci {{.x}}").await;
        assert!(reply.starts_with("Success!"));

        let hooks = f.registry.list("conv").await.unwrap();
        assert!(hooks[0].has_template);
    }

    #[tokio::test]
    async fn remove_then_list() {
        let f = fixture().await;
        f.say("conv", "!webhook create beta").await;
        f.say("conv", "!webhook create alpha {{.x}}").await;

        let today = chrono::Utc::now().format("%Y-%m-%d");
        let reply = f.say("conv", "!webhook list").await;
        assert_eq!(
            reply,
            format!(
                "Webhooks in this conversation:\n\
                 • alpha (custom template, created {today})\n\
                 • beta (created {today})"
            )
        );

        let reply = f.say("conv", "!webhook remove beta").await;
        assert!(reply.starts_with("Success!"));
        let reply = f.say("conv", "!webhook remove beta").await;
        assert!(reply.contains("No webhook named `beta`"));

        f.say("conv", "!webhook remove alpha").await;
        let reply = f.say("conv", "!webhook list").await;
        assert!(reply.starts_with("There are no webhooks"));
    }

    #[tokio::test]
    async fn help_and_usage_do_not_touch_registry() {
        let f = fixture().await;
        assert!(f.say("conv", "!webhook help").await.contains("{{.title}}"));
        assert!(f.say("conv", "!webhook remove").await.starts_with("Usage:"));
        assert!(f.registry.list("conv").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ignores_own_messages_and_chatter() {
        let f = fixture().await;
        for (sender, body) in [("webhookbot", "!webhook list"), ("ann", "lunch?")] {
            let message = InboundMessage {
                conversation_id: "conv".to_string(),
                sender: sender.to_string(),
                body: body.to_string(),
            };
            f.handler.handle(&message).await.unwrap();
        }
        assert!(f.chat.sent().is_empty());
    }

    #[test]
    fn advertisement_carries_extended_help_for_mutating_commands() {
        let advert = advertisement();
        let with_extended: Vec<&str> = advert
            .commands
            .iter()
            .filter(|c| c.extended.is_some())
            .map(|c| c.name)
            .collect();
        assert_eq!(
            with_extended,
            ["webhook create", "webhook update", "webhook remove"]
        );

        let json = serde_json::to_value(&advert).unwrap();
        assert!(json["commands"][0]["extended"]["body"]
            .as_str()
            .unwrap()
            .contains("!webhook create alerts *{{.title}}*"));
        assert!(json["commands"][2].get("extended").is_none());
    }

    #[tokio::test]
    async fn deeply_nested_template_is_refused() {
        let f = fixture().await;
        let body = format!("!webhook create deep {}", "{{if .a}}".repeat(1500));
        let reply = f.say("conv", &body).await;
        assert!(reply.contains("nested too deeply"));
        assert!(f.registry.list("conv").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn storage_failure_replies_then_stops_listener() {
        let f = fixture().await;
        f.registry.close().await;

        let (tx, rx) = mpsc::channel(1);
        tx.send(InboundMessage {
            conversation_id: "conv".to_string(),
            sender: "ann".to_string(),
            body: "!webhook list".to_string(),
        })
        .await
        .unwrap();

        let err = listen(f.handler, rx, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("Storage error"));
        assert_eq!(
            f.chat.last_to("conv").as_deref(),
            Some("Something went wrong on my end, please try again later.")
        );
    }

    #[tokio::test]
    async fn listener_stops_on_cancel_and_fails_on_closed_stream() {
        let f = fixture().await;
        let (tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        cancel.cancel();
        listen(f.handler, rx, cancel).await.unwrap();
        drop(tx);

        let f = fixture().await;
        let (tx, rx) = mpsc::channel(1);
        drop(tx);
        assert!(listen(f.handler, rx, CancellationToken::new()).await.is_err());
    }
}
