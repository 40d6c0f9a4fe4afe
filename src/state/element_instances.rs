use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::error::{StateError, StateResult};
use crate::record::ProcessInstanceRecord;
use crate::types::Key;

use super::db::{pair_key, u64_key};
use super::{ColumnFamily, ProcessingState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode, Serialize, Deserialize)]
pub enum ElementState {
    Activating,
    Activated,
    Completing,
    Terminating,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct ElementInstance {
    pub key: Key,
    pub state: ElementState,
    pub value: ProcessInstanceRecord,
    /// Job created for a service task.
    pub job_key: Option<Key>,
    /// Child process instance created by a call activity.
    pub called_child_key: Option<Key>,
}

impl ElementInstance {
    pub fn new(key: Key, value: ProcessInstanceRecord) -> Self {
        Self {
            key,
            state: ElementState::Activating,
            value,
            job_key: None,
            called_child_key: None,
        }
    }

    pub fn flow_scope_key(&self) -> Option<Key> {
        self.value.flow_scope_key
    }

    pub fn can_terminate(&self) -> bool {
        self.state != ElementState::Terminating
    }
}

// Element instances and their children-by-flow-scope index
impl ProcessingState {
    pub fn element_instance(&self, key: Key) -> StateResult<Option<ElementInstance>> {
        self.db.get(ColumnFamily::ElementInstances, &u64_key(key))
    }

    pub fn put_element_instance(&mut self, instance: &ElementInstance) -> StateResult<()> {
        self.db
            .put(ColumnFamily::ElementInstances, u64_key(instance.key), instance)?;
        if let Some(scope) = instance.flow_scope_key() {
            self.db
                .put(ColumnFamily::ElementChildren, pair_key(scope, instance.key), &())?;
        }
        Ok(())
    }

    pub fn update_element_instance<F>(
        &mut self,
        key: Key,
        update: F,
    ) -> StateResult<ElementInstance>
    where
        F: FnOnce(&mut ElementInstance),
    {
        let mut instance = self
            .element_instance(key)?
            .ok_or_else(|| {
                StateError::Inconsistent(format!("element instance {} not found", key))
            })?;
        update(&mut instance);
        self.db
            .put(ColumnFamily::ElementInstances, u64_key(key), &instance)?;
        Ok(instance)
    }

    pub fn remove_element_instance(&mut self, key: Key) -> StateResult<Option<ElementInstance>> {
        let instance = self.element_instance(key)?;
        if let Some(instance) = &instance {
            self.db.delete(ColumnFamily::ElementInstances, &u64_key(key));
            if let Some(scope) = instance.flow_scope_key() {
                self.db
                    .delete(ColumnFamily::ElementChildren, &pair_key(scope, key));
            }
        }
        Ok(instance)
    }

    /// Keys of the live children of `scope`, in key order.
    pub fn children_of(&self, scope: Key) -> Vec<Key> {
        let prefix = u64_key(scope);
        self.db
            .prefix_scan(ColumnFamily::ElementChildren, &prefix)
            .filter_map(|(key, _)| key.get(8..16))
            .filter_map(|child| child.try_into().ok().map(u64::from_be_bytes))
            .collect()
    }

    pub fn has_children(&self, scope: Key) -> bool {
        let prefix = u64_key(scope);
        self.db
            .prefix_scan(ColumnFamily::ElementChildren, &prefix)
            .next()
            .is_some()
    }

    /// Follows parent links up to the root process instance.
    pub fn root_process_instance(&self, process_instance_key: Key) -> StateResult<Key> {
        let mut current = process_instance_key;
        while let Some(instance) = self.element_instance(current)? {
            match instance.value.parent_process_instance_key {
                Some(parent) if parent != current => current = parent,
                _ => break,
            }
        }
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ElementType;

    fn record(instance: Key, scope: Option<Key>, parent: Option<Key>) -> ProcessInstanceRecord {
        ProcessInstanceRecord {
            bpmn_process_id: "p".into(),
            version: 1,
            process_definition_key: 1,
            process_instance_key: instance,
            element_id: "p".into(),
            element_type: ElementType::Process,
            flow_scope_key: scope,
            parent_process_instance_key: parent,
            parent_element_instance_key: None,
        }
    }

    #[test]
    fn test_children_index() {
        let mut state = ProcessingState::new(1);
        state
            .put_element_instance(&ElementInstance::new(10, record(10, None, None)))
            .unwrap();
        for child in [12, 11] {
            state
                .put_element_instance(&ElementInstance::new(child, record(10, Some(10), None)))
                .unwrap();
        }
        assert_eq!(state.children_of(10), vec![11, 12]);
        assert!(state.has_children(10));

        state.remove_element_instance(11).unwrap();
        state.remove_element_instance(12).unwrap();
        assert!(!state.has_children(10));
        assert!(state.element_instance(11).unwrap().is_none());
    }

    #[test]
    fn test_update_state() {
        let mut state = ProcessingState::new(1);
        state
            .put_element_instance(&ElementInstance::new(10, record(10, None, None)))
            .unwrap();
        let updated = state
            .update_element_instance(10, |i| i.state = ElementState::Activated)
            .unwrap();
        assert_eq!(updated.state, ElementState::Activated);
        assert!(state.update_element_instance(99, |_| {}).is_err());
    }

    #[test]
    fn test_root_process_instance() {
        let mut state = ProcessingState::new(1);
        state
            .put_element_instance(&ElementInstance::new(1, record(1, None, None)))
            .unwrap();
        state
            .put_element_instance(&ElementInstance::new(5, record(5, None, Some(1))))
            .unwrap();
        state
            .put_element_instance(&ElementInstance::new(9, record(9, None, Some(5))))
            .unwrap();
        assert_eq!(state.root_process_instance(9).unwrap(), 1);
        assert_eq!(state.root_process_instance(1).unwrap(), 1);
    }
}
