use std::collections::HashMap;
use std::marker::PhantomData;

use tracing::{debug, info};

use crate::convert::PreviewMode;
use crate::session::Session;

/// 授权命令窗口。只有命令总线在执行命令时才能签发，且不可跨线程传递；
/// 需要命令上下文的转换（如创建实体）必须持有它。
pub struct CommandWindow {
    _main_thread: PhantomData<*const ()>,
}

impl CommandWindow {
    pub(crate) fn open() -> Self {
        Self {
            _main_thread: PhantomData,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub name: String,
    pub args: Vec<String>,
}

impl CommandRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct CommandResponse {
    pub success: bool,
    pub message: Option<String>,
}

impl CommandResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
        }
    }
}

pub trait CommandHandler: Send + Sync {
    fn name(&self) -> &'static str;
    fn execute(
        &self,
        request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse;
}

pub struct CommandContext<'a> {
    pub session: &'a mut Session,
    pub window: CommandWindow,
}

pub struct CommandBus {
    handlers: HashMap<&'static str, Box<dyn CommandHandler>>,
}

impl Default for CommandBus {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandBus {
    pub fn new() -> Self {
        let mut bus = Self {
            handlers: HashMap::new(),
        };
        bus.register(ConvertPendingCommand);
        bus.register(PreviewModeCommand);
        bus.register(ClearPreviewCommand);
        bus.register(PopulatePreviewCommand);
        bus
    }

    pub fn register<H: CommandHandler + 'static>(&mut self, handler: H) {
        self.handlers.insert(handler.name(), Box::new(handler));
    }

    /// 执行命令。每次执行签发一个新的命令窗口，命令返回后窗口随上下文一起失效。
    pub fn dispatch(&self, request: &CommandRequest, session: &mut Session) -> CommandResponse {
        let Some(handler) = self.handlers.get(request.name.as_str()) else {
            return CommandResponse::err(format!("未知命令: {}", request.name));
        };
        debug!(command = %request.name, args = ?request.args, "执行命令");
        let mut context = CommandContext {
            session,
            window: CommandWindow::open(),
        };
        handler.execute(request, &mut context)
    }

    pub fn available_commands(&self) -> impl Iterator<Item = &&'static str> {
        self.handlers.keys()
    }
}

/// 处理排队的实体转换请求，并提交已转换的烘焙结果。
struct ConvertPendingCommand;

impl CommandHandler for ConvertPendingCommand {
    fn name(&self) -> &'static str {
        "convert_pending"
    }

    fn execute(
        &self,
        _request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse {
        match context.session.drain_conversions(&context.window) {
            Ok(summary) => {
                info!(
                    converted = summary.report.succeeded,
                    failed = summary.report.failed,
                    committed = summary.committed,
                    "转换请求已处理"
                );
                CommandResponse::ok(format!(
                    "已处理 {} 个转换请求，成功 {}，失败 {}，提交 {} 个实体",
                    summary.report.processed,
                    summary.report.succeeded,
                    summary.report.failed,
                    summary.committed
                ))
            }
            Err(err) => CommandResponse::err(format!("处理转换请求失败: {err}")),
        }
    }
}

struct PreviewModeCommand;

impl CommandHandler for PreviewModeCommand {
    fn name(&self) -> &'static str {
        "preview_mode"
    }

    fn execute(
        &self,
        request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse {
        let Some(arg) = request.args.first() else {
            return CommandResponse::ok(format!(
                "当前预览模式: {}",
                context.session.preview().mode()
            ));
        };
        let mode: PreviewMode = match arg.parse() {
            Ok(mode) => mode,
            Err(err) => return CommandResponse::err(err),
        };
        match context.session.set_preview_mode(mode) {
            Ok(()) => CommandResponse::ok(format!("预览模式已切换为 {mode}")),
            Err(err) => CommandResponse::err(format!("切换预览模式失败: {err}")),
        }
    }
}

struct ClearPreviewCommand;

impl CommandHandler for ClearPreviewCommand {
    fn name(&self) -> &'static str {
        "clear_preview"
    }

    fn execute(
        &self,
        _request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse {
        let erased = context.session.preview_mut().clear_server();
        CommandResponse::ok(format!("已从显示中移除 {erased} 个预览实体"))
    }
}

struct PopulatePreviewCommand;

impl CommandHandler for PopulatePreviewCommand {
    fn name(&self) -> &'static str {
        "populate_preview"
    }

    fn execute(
        &self,
        _request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse {
        let drawn = context.session.preview_mut().populate_server();
        CommandResponse::ok(format!("已重新绘制 {drawn} 个预览实体"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Session, SessionOptions};

    #[test]
    fn unknown_command_is_reported() {
        let mut session = Session::new(SessionOptions::default());
        let bus = CommandBus::new();
        let response = bus.dispatch(&CommandRequest::new("explode"), &mut session);
        assert!(!response.success);
        assert_eq!(bus.available_commands().count(), 4);
    }

    #[test]
    fn preview_mode_command_switches_and_rejects_bad_values() {
        let mut session = Session::new(SessionOptions::default());
        let bus = CommandBus::new();

        let request = CommandRequest::new("preview_mode").with_arg("wireframe");
        assert!(bus.dispatch(&request, &mut session).success);
        assert_eq!(session.preview().mode(), PreviewMode::Wireframe);

        let request = CommandRequest::new("preview_mode").with_arg("hologram");
        assert!(!bus.dispatch(&request, &mut session).success);
        assert_eq!(session.preview().mode(), PreviewMode::Wireframe);
    }

    #[test]
    fn convert_pending_with_empty_queue_succeeds() {
        let mut session = Session::new(SessionOptions::default());
        let bus = CommandBus::new();
        let response = bus.dispatch(&CommandRequest::new("convert_pending"), &mut session);
        assert!(response.success);
    }
}
