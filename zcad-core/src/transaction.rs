//! 事务作用域：所有对文档的读写都必须在 `begin` 与 `end` 之间完成。
//!
//! 事务签发的 [`EntityHandle`] 带有作用域编号，只能在签发它的事务内解引用。
//! 事务结束后编号作废，旧句柄再被使用属于编程错误，会直接 panic。

use std::collections::{BTreeSet, HashMap};

use thiserror::Error;
use tracing::{debug, trace};

use crate::change::DocumentChange;
use crate::document::{Document, Entity, EntityId, EntityProperties, Record, SessionRef, Units};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DbError {
    #[error("object {0} does not exist")]
    NotFound(u64),
    #[error("object {0} was erased in this transaction")]
    Erased(u64),
    #[error("handle is not open for write")]
    NotOpenForWrite,
    #[error("handle does not refer to a container")]
    NotAContainer,
    #[error("handle refers to the model space container, not an entity")]
    NotAnEntity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(u64);

impl ScopeId {
    #[inline]
    pub fn get(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandleTarget {
    ModelSpace,
    Entity(EntityId),
}

/// 事务内的实体句柄，归签发它的事务独占。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityHandle {
    scope: ScopeId,
    target: HandleTarget,
    mode: OpenMode,
}

impl EntityHandle {
    #[inline]
    pub fn scope(&self) -> ScopeId {
        self.scope
    }

    #[inline]
    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// 句柄指向的持久 ID；模型空间容器返回 None。
    #[inline]
    pub fn id(&self) -> Option<EntityId> {
        match self.target {
            HandleTarget::ModelSpace => None,
            HandleTarget::Entity(id) => Some(id),
        }
    }
}

/// 只读查询接口，供图节点刷新引用快照。
pub trait ObjectLookup {
    fn lookup(&self, id: EntityId) -> Option<Entity>;
    fn ids_on_layer(&self, layer: &str) -> Vec<EntityId>;
}

/// 持有文档、会话编号与已提交变更的数据库。
#[derive(Debug)]
pub struct Database {
    document: Document,
    session: u64,
    next_scope: u64,
    outbox: Vec<DocumentChange>,
}

impl Database {
    pub fn new() -> Self {
        Self::with_document(Document::new())
    }

    pub fn with_document(document: Document) -> Self {
        Self {
            document,
            session: 1,
            next_scope: 1,
            outbox: Vec::new(),
        }
    }

    /// 开启事务。借用规则保证同一时刻只有一个事务。
    pub fn begin(&mut self) -> Transaction<'_> {
        let scope = ScopeId(self.next_scope);
        self.next_scope += 1;
        trace!(scope = scope.0, "开启事务");
        Transaction {
            start_units: self.document.units(),
            db: self,
            scope,
            undo: HashMap::new(),
            created_layers: Vec::new(),
            journal: ChangeJournal::default(),
            finished: false,
        }
    }

    #[inline]
    pub fn session(&self) -> u64 {
        self.session
    }

    /// 为对象生成会话引用，对象不存在时返回 None。
    pub fn session_ref(&self, id: EntityId) -> Option<SessionRef> {
        if self.document.contains(id) {
            Some(SessionRef {
                session: self.session,
                id,
            })
        } else {
            None
        }
    }

    /// 解析会话引用，跨会话或对象已删除时返回 None。
    pub fn resolve(&self, reference: SessionRef) -> Option<EntityId> {
        if reference.session == self.session && self.document.contains(reference.id) {
            Some(reference.id)
        } else {
            None
        }
    }

    /// 保存快照（持久化内容）。
    pub fn snapshot(&self) -> Document {
        self.document.clone()
    }

    /// 以新会话重新打开文档：持久句柄保留，会话引用全部失效。
    pub fn reopen(&mut self, document: Document) {
        self.document = document;
        self.session += 1;
        self.outbox.clear();
        debug!(session = self.session, "文档已重新打开");
    }

    /// 取出所有已提交但尚未分发的变更通知。
    pub fn take_changes(&mut self) -> Vec<DocumentChange> {
        std::mem::take(&mut self.outbox)
    }

    #[inline]
    pub fn has_pending_changes(&self) -> bool {
        !self.outbox.is_empty()
    }
}

#[derive(Debug, Default)]
struct ChangeJournal {
    created: BTreeSet<EntityId>,
    modified: BTreeSet<EntityId>,
    erased: BTreeSet<EntityId>,
}

impl ChangeJournal {
    fn created(&mut self, id: EntityId) {
        self.created.insert(id);
    }

    fn modified(&mut self, id: EntityId) {
        if !self.created.contains(&id) {
            self.modified.insert(id);
        }
    }

    fn erased(&mut self, id: EntityId) {
        self.modified.remove(&id);
        if !self.created.remove(&id) {
            self.erased.insert(id);
        }
    }

    fn into_changes(self) -> Vec<DocumentChange> {
        let mut changes = Vec::new();
        if !self.created.is_empty() {
            changes.push(DocumentChange::ObjectCreated(self.created));
        }
        if !self.modified.is_empty() {
            changes.push(DocumentChange::ObjectModified(self.modified));
        }
        if !self.erased.is_empty() {
            changes.push(DocumentChange::ObjectErased(self.erased));
        }
        changes
    }
}

pub struct Transaction<'db> {
    db: &'db mut Database,
    scope: ScopeId,
    /// 首次写入前的记录，`None` 表示该对象在本事务中新建。
    undo: HashMap<EntityId, Option<Record>>,
    created_layers: Vec<String>,
    start_units: Units,
    journal: ChangeJournal,
    finished: bool,
}

impl<'db> Transaction<'db> {
    #[inline]
    pub fn scope(&self) -> ScopeId {
        self.scope
    }

    /// 返回模型空间容器句柄。访问模式不在此处校验，写入只读句柄会在写操作时报错。
    pub fn root_container(&self, open_for_write: bool) -> EntityHandle {
        EntityHandle {
            scope: self.scope,
            target: HandleTarget::ModelSpace,
            mode: if open_for_write {
                OpenMode::Write
            } else {
                OpenMode::Read
            },
        }
    }

    pub fn open(&self, id: EntityId, mode: OpenMode) -> Result<EntityHandle, DbError> {
        if !self.db.document.contains(id) {
            return Err(DbError::NotFound(id.get()));
        }
        Ok(EntityHandle {
            scope: self.scope,
            target: HandleTarget::Entity(id),
            mode,
        })
    }

    pub fn entity(&self, handle: &EntityHandle) -> Result<&Entity, DbError> {
        let id = self.entity_id(handle)?;
        self.db
            .document
            .entity(id)
            .ok_or(DbError::Erased(id.get()))
    }

    pub fn properties(&self, handle: &EntityHandle) -> Result<&EntityProperties, DbError> {
        let id = self.entity_id(handle)?;
        self.db
            .document
            .record(id)
            .map(|record| &record.properties)
            .ok_or(DbError::Erased(id.get()))
    }

    pub fn entity_mut(&mut self, handle: &EntityHandle) -> Result<&mut Entity, DbError> {
        let id = self.writable_entity(handle)?;
        self.journal.modified(id);
        let record = self
            .db
            .document
            .record_mut(id)
            .ok_or(DbError::Erased(id.get()))?;
        Ok(&mut record.entity)
    }

    pub fn set_properties(
        &mut self,
        handle: &EntityHandle,
        properties: EntityProperties,
    ) -> Result<(), DbError> {
        let id = self.writable_entity(handle)?;
        self.journal.modified(id);
        let record = self
            .db
            .document
            .record_mut(id)
            .ok_or(DbError::Erased(id.get()))?;
        record.properties = properties;
        Ok(())
    }

    /// 追加实体到容器。容器必须以写模式打开。
    pub fn append(
        &mut self,
        container: &EntityHandle,
        entity: Entity,
        properties: EntityProperties,
    ) -> Result<EntityHandle, DbError> {
        self.check_scope(container);
        if container.target != HandleTarget::ModelSpace {
            return Err(DbError::NotAContainer);
        }
        if container.mode != OpenMode::Write {
            return Err(DbError::NotOpenForWrite);
        }
        let layer = entity.layer_name().to_string();
        if !self.db.document.has_layer(&layer) {
            self.created_layers.push(layer);
        }
        let id = self.db.document.insert(entity, properties);
        self.undo.insert(id, None);
        self.journal.created(id);
        trace!(scope = self.scope.0, id = id.get(), "追加实体");
        Ok(EntityHandle {
            scope: self.scope,
            target: HandleTarget::Entity(id),
            mode: OpenMode::Write,
        })
    }

    pub fn erase(&mut self, handle: &EntityHandle) -> Result<(), DbError> {
        let id = self.writable_entity(handle)?;
        self.db
            .document
            .remove(id)
            .ok_or(DbError::Erased(id.get()))?;
        self.journal.erased(id);
        Ok(())
    }

    #[inline]
    pub fn units(&self) -> Units {
        self.db.document.units()
    }

    pub fn set_units(&mut self, units: Units) {
        self.db.document.set_units(units);
    }

    /// 模型空间内全部对象的持久 ID。
    pub fn ids(&self) -> Vec<EntityId> {
        self.db.document.entities().map(|(id, _)| id).collect()
    }

    /// 等价于 `end(true)`。
    pub fn commit(self) {
        self.end(true);
    }

    /// 等价于 `end(false)`：回滚本事务中的全部写入，包括为读取而临时做的写入。
    pub fn abort(self) {
        self.end(false);
    }

    pub fn end(mut self, commit: bool) {
        if commit {
            self.publish();
        } else {
            self.rollback();
        }
        self.finished = true;
    }

    fn publish(&mut self) {
        let journal = std::mem::take(&mut self.journal);
        let mut changes = journal.into_changes();
        let current_units = self.db.document.units();
        if current_units != self.start_units {
            changes.push(DocumentChange::UnitsChanged {
                previous: self.start_units,
                current: current_units,
            });
        }
        debug!(
            scope = self.scope.0,
            changes = changes.len(),
            "事务已提交"
        );
        self.db.outbox.extend(changes);
        self.undo.clear();
    }

    fn rollback(&mut self) {
        let restored = self.undo.len();
        for (id, prior) in self.undo.drain() {
            match prior {
                Some(record) => self.db.document.restore(id, record),
                None => {
                    self.db.document.remove(id);
                }
            }
        }
        for layer in self.created_layers.drain(..) {
            self.db.document.remove_layer(&layer);
        }
        self.db.document.set_units(self.start_units);
        self.journal = ChangeJournal::default();
        debug!(scope = self.scope.0, restored, "事务已回滚");
    }

    fn check_scope(&self, handle: &EntityHandle) {
        assert!(
            handle.scope == self.scope,
            "entity handle from scope {} used in scope {} after its transaction ended",
            handle.scope.0,
            self.scope.0
        );
    }

    fn entity_id(&self, handle: &EntityHandle) -> Result<EntityId, DbError> {
        self.check_scope(handle);
        match handle.target {
            HandleTarget::ModelSpace => Err(DbError::NotAnEntity),
            HandleTarget::Entity(id) => Ok(id),
        }
    }

    fn writable_entity(&mut self, handle: &EntityHandle) -> Result<EntityId, DbError> {
        let id = self.entity_id(handle)?;
        if handle.mode != OpenMode::Write {
            return Err(DbError::NotOpenForWrite);
        }
        if !self.undo.contains_key(&id) {
            let prior = self
                .db
                .document
                .record(id)
                .cloned()
                .ok_or(DbError::Erased(id.get()))?;
            self.undo.insert(id, Some(prior));
        }
        Ok(id)
    }
}

impl ObjectLookup for Transaction<'_> {
    fn lookup(&self, id: EntityId) -> Option<Entity> {
        self.db.document.entity(id).cloned()
    }

    fn ids_on_layer(&self, layer: &str) -> Vec<EntityId> {
        self.db
            .document
            .entities()
            .filter(|(_, entity)| entity.layer_name() == layer)
            .map(|(id, _)| id)
            .collect()
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.rollback();
        }
    }
}
