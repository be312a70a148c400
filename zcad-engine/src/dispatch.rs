//! 把后台线程的工作送回主线程执行。
//!
//! 登记表、预览服务器、事务与转换队列都只能在主线程访问；后台线程通过
//! [`MainThreadHandle::post`] 提交闭包，主线程在 `Session::pump` 中统一执行。

use std::sync::mpsc;

use crate::errors::SessionClosed;
use crate::session::Session;

pub type MainThreadJob = Box<dyn FnOnce(&mut Session) + Send>;

/// 可跨线程克隆的投递句柄。
#[derive(Clone)]
pub struct MainThreadHandle {
    sender: mpsc::Sender<MainThreadJob>,
}

impl MainThreadHandle {
    pub fn post(&self, job: impl FnOnce(&mut Session) + Send + 'static) -> Result<(), SessionClosed> {
        self.sender.send(Box::new(job)).map_err(|_| SessionClosed)
    }
}

pub struct MainThreadQueue {
    sender: mpsc::Sender<MainThreadJob>,
    receiver: mpsc::Receiver<MainThreadJob>,
}

impl Default for MainThreadQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MainThreadQueue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self { sender, receiver }
    }

    pub fn handle(&self) -> MainThreadHandle {
        MainThreadHandle {
            sender: self.sender.clone(),
        }
    }

    /// 取出当前已到达的全部工作，不阻塞。
    pub fn take_jobs(&self) -> Vec<MainThreadJob> {
        self.receiver.try_iter().collect()
    }
}
