//! 源对象到其 CAD 侧瞬态实体的登记表。
//!
//! 条目存放在带代数校验的槽位表中，另以 `HashMap` 从源对象标识映射到槽位键。
//! 槽位被回收后代数递增，先前取得的 [`SlotKey`] 随即失效，不会误指向新条目。

use std::collections::{HashMap, HashSet};

use tracing::{debug, trace};
use zcad_graph::SourceId;

use crate::display::{TransientEntity, TransientKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotKey {
    index: u32,
    generation: u32,
}

impl SlotKey {
    #[inline]
    pub fn index(self) -> u32 {
        self.index
    }

    #[inline]
    pub fn generation(self) -> u32 {
        self.generation
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

struct SlotArena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> SlotArena<T> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    fn insert(&mut self, value: T) -> SlotKey {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return SlotKey {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        SlotKey {
            index,
            generation: 0,
        }
    }

    fn get(&self, key: SlotKey) -> Option<&T> {
        self.slots
            .get(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    fn get_mut(&mut self, key: SlotKey) -> Option<&mut T> {
        self.slots
            .get_mut(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    fn remove(&mut self, key: SlotKey) -> Option<T> {
        let slot = self.slots.get_mut(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(key.index);
        self.len -= 1;
        Some(value)
    }
}

/// 一个源对象当前的全部物化实体。
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterEntry {
    pub id: SourceId,
    pub entities: Vec<TransientEntity>,
}

pub struct ObjectRegister {
    arena: SlotArena<RegisterEntry>,
    index: HashMap<SourceId, SlotKey>,
}

impl Default for ObjectRegister {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectRegister {
    pub fn new() -> Self {
        Self {
            arena: SlotArena::new(),
            index: HashMap::new(),
        }
    }

    /// 以 `entities` 整体替换 `id` 的条目。
    ///
    /// 返回被替换下来、且不在新集合中的旧实体；释放它们由调用方负责。
    /// 同一集合重复登记不会产生重复条目，也不会返回任何实体。
    pub fn register_object(
        &mut self,
        id: SourceId,
        entities: Vec<TransientEntity>,
    ) -> Vec<TransientEntity> {
        if let Some(entry) = self
            .index
            .get(&id)
            .copied()
            .and_then(|key| self.arena.get_mut(key))
        {
            let retained: HashSet<TransientKey> = entities.iter().map(|e| e.key()).collect();
            let previous = std::mem::replace(&mut entry.entities, entities);
            trace!(source = %id, count = entry.entities.len(), "替换登记条目");
            return previous
                .into_iter()
                .filter(|entity| !retained.contains(&entity.key()))
                .collect();
        }

        trace!(source = %id, count = entities.len(), "新增登记条目");
        let key = self.arena.insert(RegisterEntry { id, entities });
        self.index.insert(id, key);
        Vec::new()
    }

    pub fn try_get_object(&self, id: SourceId) -> Option<&[TransientEntity]> {
        self.index
            .get(&id)
            .and_then(|key| self.arena.get(*key))
            .map(|entry| entry.entities.as_slice())
    }

    /// 移除条目并交还其实体的所有权。
    pub fn remove_object(&mut self, id: SourceId) -> Option<Vec<TransientEntity>> {
        let key = self.index.remove(&id)?;
        self.arena.remove(key).map(|entry| entry.entities)
    }

    /// 一次性移除所有不在 `preserve` 中的条目，返回被移除的条目。
    ///
    /// 待删除的标识在任何移除发生前先行收集，移除过程不受登记表后续变化影响。
    pub fn remove_deleted_objects(&mut self, preserve: &HashSet<SourceId>) -> Vec<RegisterEntry> {
        let doomed: Vec<SourceId> = self
            .index
            .keys()
            .filter(|id| !preserve.contains(id))
            .copied()
            .collect();

        let mut removed = Vec::with_capacity(doomed.len());
        for id in doomed {
            if let Some(entities) = self.remove_object(id) {
                removed.push(RegisterEntry { id, entities });
            }
        }
        if !removed.is_empty() {
            debug!(removed = removed.len(), remaining = self.len(), "清理孤立登记条目");
        }
        removed
    }

    /// 清空登记表并交还全部条目。
    pub fn drain(&mut self) -> Vec<RegisterEntry> {
        let ids: Vec<SourceId> = self.index.keys().copied().collect();
        ids.into_iter()
            .filter_map(|id| {
                self.remove_object(id)
                    .map(|entities| RegisterEntry { id, entities })
            })
            .collect()
    }

    pub fn key_of(&self, id: SourceId) -> Option<SlotKey> {
        self.index.get(&id).copied()
    }

    /// 以槽位键取条目；槽位已被回收或复用时返回 None。
    pub fn get_by_key(&self, key: SlotKey) -> Option<&RegisterEntry> {
        self.arena.get(key)
    }

    pub fn contains(&self, id: SourceId) -> bool {
        self.index.contains_key(&id)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.arena.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> impl Iterator<Item = SourceId> + '_ {
        self.index.keys().copied()
    }

    pub fn entries(&self) -> impl Iterator<Item = &RegisterEntry> + '_ {
        self.index.values().filter_map(|key| self.arena.get(*key))
    }

    /// 全部已登记实体的数量。
    pub fn entity_count(&self) -> usize {
        self.entries().map(|entry| entry.entities.len()).sum()
    }
}
