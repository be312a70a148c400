use tracing::warn;

use crate::display::{Residency, TransientEntity};
use crate::errors::{Rejection, ValidationError};

/// 校验模式。调试构建默认严格，发布构建默认静默。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    /// 遇到第一个不合格实体即返回错误，尽早暴露调用方的用法问题。
    Strict,
    /// 丢弃不合格实体并记录告警。
    Silent,
}

impl ValidationMode {
    pub fn for_build() -> Self {
        if cfg!(debug_assertions) {
            ValidationMode::Strict
        } else {
            ValidationMode::Silent
        }
    }

    /// 由配置项 `silent_validation` 得到模式，未配置时按构建类型决定。
    pub fn from_silent(silent: Option<bool>) -> Self {
        match silent {
            Some(true) => ValidationMode::Silent,
            Some(false) => ValidationMode::Strict,
            None => Self::for_build(),
        }
    }

    #[inline]
    pub fn is_silent(self) -> bool {
        self == ValidationMode::Silent
    }
}

fn rejection(entity: &TransientEntity) -> Option<Rejection> {
    if entity.is_disposed() {
        return Some(Rejection::Disposed);
    }
    if let Residency::Database(id) = entity.residency() {
        return Some(Rejection::DatabaseResident(id.get()));
    }
    if !entity.entity().is_realized() {
        return Some(Rejection::Unrealized);
    }
    None
}

/// 过滤出可以在创建它们的事务之外继续持有的实体。
///
/// 严格模式下第一个不合格实体会导致整体返回错误；静默模式下不合格实体被丢弃，
/// 其余实体按原顺序返回。
pub fn validate_for_transient_use(
    entities: Vec<TransientEntity>,
    silent: bool,
) -> Result<Vec<TransientEntity>, ValidationError> {
    let mut accepted = Vec::with_capacity(entities.len());
    for entity in entities {
        match rejection(&entity) {
            None => accepted.push(entity),
            Some(reason) => {
                let error = ValidationError {
                    key: entity.key().get(),
                    kind: entity.entity().kind_name(),
                    reason,
                };
                if !silent {
                    return Err(error);
                }
                warn!(%error, "丢弃不可脱离事务使用的实体");
            }
        }
    }
    Ok(accepted)
}
