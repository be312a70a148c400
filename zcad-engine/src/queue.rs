//! 转换请求队列。
//!
//! 宿主只允许在授权命令窗口内创建实体，请求方因此先入队，等命令执行时
//! 再由 [`ConversionRequestQueue::run`] 统一处理。队列以 `Rc` 共享，
//! 只能在主线程上使用。

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;

use tracing::{debug, warn};
use zcad_core::document::Entity;
use zcad_core::panic_payload_to_string;
use zcad_graph::geometry::Geometry;

use crate::command::CommandWindow;
use crate::convert::SolidConverter;
use crate::errors::QueueError;

/// 一次转换的结果。失败时 `converted_entities` 为空。
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionResult {
    pub converted_entities: Vec<Entity>,
    pub success: bool,
}

impl ConversionResult {
    fn failed() -> Self {
        Self {
            converted_entities: Vec::new(),
            success: false,
        }
    }
}

/// 完成回调，返回值表示结果是否已被处理。
pub type ConversionCallback = Box<dyn FnOnce(ConversionResult) -> bool>;

pub struct ConversionRequest {
    pub payload: Geometry,
    pub callback: ConversionCallback,
}

impl ConversionRequest {
    pub fn new(
        payload: Geometry,
        callback: impl FnOnce(ConversionResult) -> bool + 'static,
    ) -> Self {
        Self {
            payload,
            callback: Box::new(callback),
        }
    }
}

/// 一次处理的统计。
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// 回调返回 false 或回调自身 panic 的请求数。
    pub unhandled: usize,
    /// 处理期间新入队、留待下一次处理的请求数。
    pub deferred: usize,
}

struct Queued {
    seq: u64,
    request: ConversionRequest,
}

#[derive(Default)]
struct QueueInner {
    items: RefCell<VecDeque<Queued>>,
    running: Cell<bool>,
    next_seq: Cell<u64>,
}

/// 先进先出的转换请求队列。克隆得到的是同一个队列。
#[derive(Clone, Default)]
pub struct ConversionRequestQueue {
    inner: Rc<QueueInner>,
}

struct RunningGuard<'a>(&'a Cell<bool>);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl ConversionRequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加请求，返回其序号。处理期间入队的请求留到下一次 `run`。
    pub fn enqueue(&self, request: ConversionRequest) -> u64 {
        let seq = self.inner.next_seq.get();
        self.inner.next_seq.set(seq.wrapping_add(1));
        let kind = request.payload.kind_name();
        self.inner
            .items
            .borrow_mut()
            .push_back(Queued { seq, request });
        debug!(seq, kind, "转换请求入队");
        seq
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.items.borrow().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.inner.running.get()
    }

    /// 按入队顺序处理调用开始时队列中的全部请求。
    ///
    /// 单个请求转换失败（包括 panic）时，其回调仍以 `success = false` 被调用，
    /// 其余请求照常处理。嵌套调用返回 [`QueueError::Reentrant`]。
    pub fn run(
        &self,
        window: &CommandWindow,
        converter: &dyn SolidConverter,
    ) -> Result<DrainReport, QueueError> {
        if self.inner.running.replace(true) {
            return Err(QueueError::Reentrant);
        }
        let _guard = RunningGuard(&self.inner.running);

        let batch: Vec<Queued> = self.inner.items.borrow_mut().drain(..).collect();
        let mut report = DrainReport::default();
        debug!(count = batch.len(), "开始处理转换请求");

        for Queued { seq, request } in batch {
            let ConversionRequest { payload, callback } = request;
            let outcome =
                catch_unwind(AssertUnwindSafe(|| converter.convert_solid(window, &payload)));
            let result = match outcome {
                Ok(Ok(converted_entities)) => ConversionResult {
                    converted_entities,
                    success: true,
                },
                Ok(Err(err)) => {
                    warn!(seq, kind = payload.kind_name(), error = %err, "转换失败");
                    ConversionResult::failed()
                }
                Err(panic) => {
                    warn!(
                        seq,
                        kind = payload.kind_name(),
                        panic = %panic_payload_to_string(&*panic),
                        "转换过程 panic"
                    );
                    ConversionResult::failed()
                }
            };

            report.processed += 1;
            if result.success {
                report.succeeded += 1;
            } else {
                report.failed += 1;
            }

            let handled = match catch_unwind(AssertUnwindSafe(|| callback(result))) {
                Ok(handled) => handled,
                Err(panic) => {
                    warn!(seq, panic = %panic_payload_to_string(&*panic), "转换回调 panic");
                    false
                }
            };
            if !handled {
                report.unhandled += 1;
            }
        }

        report.deferred = self.len();
        debug!(
            processed = report.processed,
            failed = report.failed,
            deferred = report.deferred,
            "转换请求处理完成"
        );
        Ok(report)
    }
}
