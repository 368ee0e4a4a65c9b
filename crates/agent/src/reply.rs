use murmur_bus::MessageRuntime;
use murmur_core::config::ReplyConfig;
use murmur_core::{Error, MessageEnvelope, MessageKind, Result, Segment};
use murmur_memory::{BlockMessage, MemoryEngine};
use murmur_plugins::{CommandArgs, ComponentContext, PluginHost};
use murmur_providers::{LanguageModel, LlmRequest};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::streams::ChatStreamManager;

/// Orchestrates the reply path: record the envelope, gate group chatter on
/// interest, dispatch commands through the permission middleware, otherwise
/// assemble a memory-augmented prompt and answer.
pub struct ReplyGenerator {
    config: ReplyConfig,
    llm: Arc<dyn LanguageModel>,
    memory: Arc<MemoryEngine>,
    streams: Arc<ChatStreamManager>,
    host: Arc<PluginHost>,
    runtime: Arc<MessageRuntime>,
}

impl ReplyGenerator {
    pub fn new(
        config: ReplyConfig,
        llm: Arc<dyn LanguageModel>,
        memory: Arc<MemoryEngine>,
        streams: Arc<ChatStreamManager>,
        host: Arc<PluginHost>,
        runtime: Arc<MessageRuntime>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            llm,
            memory,
            streams,
            host,
            runtime,
        })
    }

    pub async fn handle_envelope(&self, envelope: &MessageEnvelope) -> Result<()> {
        self.streams.record(envelope)?;
        let text = envelope.plain_text();
        if !text.trim().is_empty() {
            self.memory
                .record_message(BlockMessage {
                    stream_key: envelope.stream_key().to_string(),
                    sender: envelope.message_info.user.readable_name().to_string(),
                    content: text.clone(),
                    timestamp_ms: envelope.timestamp_ms,
                })
                .await?;
        }

        match envelope.message_info.message_type {
            MessageKind::Notice | MessageKind::Meta => return Ok(()),
            MessageKind::Private | MessageKind::Group => {}
        }

        if let Some(command_text) = envelope.message_segment.command_text() {
            if let Some(args) = CommandArgs::parse(&command_text) {
                if self.dispatch_command(envelope, &args).await? {
                    return Ok(());
                }
            }
        }

        if !self.wants_reply(envelope).await {
            return Ok(());
        }
        self.generate_reply(envelope).await
    }

    /// Command dispatch with the permission middleware in front. Returns
    /// false when no command matches the verb, letting the message fall
    /// through to normal chat.
    async fn dispatch_command(
        &self,
        envelope: &MessageEnvelope,
        args: &CommandArgs,
    ) -> Result<bool> {
        let Some(command) = self.host.registry().find_command(&args.verb) else {
            debug!(verb = %args.verb, "No command for verb, treating as chat");
            return Ok(false);
        };

        let plugin = self
            .host
            .registry()
            .get(murmur_plugins::ComponentKind::Command, &args.verb)
            .map(|r| r.info.plugin)
            .unwrap_or_default();
        let ctx: ComponentContext = self.host.component_context(&plugin).await;

        if let Some(node) = command.required_node(args) {
            let user = &envelope.message_info.user.user_id;
            match ctx.permissions.ensure(&envelope.platform, user, &node) {
                Ok(()) => {}
                Err(Error::PermissionDenied(node)) => {
                    info!(verb = %args.verb, user = %user, node = %node, "Command denied");
                    let denial = murmur_plugins::PermissionGate::denial_message(&node);
                    self.send_reply(envelope, Segment::text(&denial)).await?;
                    return Ok(true);
                }
                Err(e) => return Err(e),
            }
        }

        match command.execute(&ctx, envelope, args).await {
            Ok(reply) => {
                self.send_reply(envelope, reply).await?;
            }
            Err(e) => {
                warn!(verb = %args.verb, error = %e, "Command failed");
                self.send_reply(
                    envelope,
                    Segment::text(&format!("Command failed: {}", e)),
                )
                .await?;
            }
        }
        Ok(true)
    }

    /// Private messages and direct mentions always reply. Other group
    /// traffic goes through the interest calculators; below the threshold
    /// the bot stays quiet.
    async fn wants_reply(&self, envelope: &MessageEnvelope) -> bool {
        if envelope.message_info.message_type == MessageKind::Private
            || envelope.message_info.to_me
            || envelope
                .message_segment
                .mentions(&envelope.message_info.self_id)
        {
            return true;
        }
        let calculators = self.host.registry().interest_calculators();
        if calculators.is_empty() {
            return false;
        }
        let mut best = 0.0f32;
        for (info, calculator) in calculators {
            match calculator.interest(envelope).await {
                Ok(score) => best = best.max(score),
                Err(e) => warn!(calculator = %info.name, error = %e, "Interest calculator failed"),
            }
        }
        best >= self.config.interest_threshold
    }

    async fn generate_reply(&self, envelope: &MessageEnvelope) -> Result<()> {
        let stream = self.streams.get_or_create(&envelope.stream_key());
        let context = stream.context_text(self.config.max_context_messages);
        let query = envelope.plain_text();

        let memories = match self.memory.retrieve(&query).await {
            Ok(memories) => memories,
            Err(e) => {
                warn!(error = %e, "Memory retrieval failed, replying without it");
                Vec::new()
            }
        };

        let mut prompt = String::new();
        for (info, component) in self.host.registry().prompts() {
            match component.render(envelope).await {
                Ok(Some(section)) => {
                    prompt.push_str(&section);
                    prompt.push('\n');
                }
                Ok(None) => {}
                Err(e) => warn!(prompt = %info.name, error = %e, "Prompt component failed"),
            }
        }
        if !memories.is_empty() {
            prompt.push_str("Relevant memories:\n");
            for memory in &memories {
                prompt.push_str(&format!("- {}\n", memory.content));
            }
            prompt.push('\n');
        }
        prompt.push_str("Conversation:\n");
        prompt.push_str(&context);
        prompt.push_str("\n\nReply to the last message naturally and briefly.");

        let request = LlmRequest::new(&self.config.model_name, &prompt)
            .with_temperature(self.config.temperature);
        let reply_text = self.llm.complete(&request).await?;
        let reply_text = reply_text.trim();
        if reply_text.is_empty() {
            return Ok(());
        }
        self.send_reply(envelope, Segment::text(reply_text)).await
    }

    async fn send_reply(&self, envelope: &MessageEnvelope, segment: Segment) -> Result<()> {
        let reply = envelope.reply_with(segment);
        self.runtime.send_outgoing(&reply).await
    }
}
