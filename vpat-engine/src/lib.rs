pub mod arena;
pub mod blocks;
pub mod command;
pub mod commands;
pub mod context;
pub mod events;
pub mod graph;
pub mod groups;
pub mod records;
pub mod scene;
pub mod selection;
pub mod session;
pub mod stack;
pub mod store;
pub mod tools;

pub mod errors {
    use std::fmt;

    use thiserror::Error;
    use vpat_core::document::{EntityId, EntityKind};
    use vpat_core::formula::FormulaError;

    /// 加载时 id 扫描发现的问题种类。
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum IdFault {
        Malformed,
        Duplicate,
        /// 占用了最大 id，之后无法再分配新 id。
        Exhausted,
    }

    impl fmt::Display for IdFault {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                IdFault::Malformed => f.write_str("malformed"),
                IdFault::Duplicate => f.write_str("not unique"),
                IdFault::Exhausted => f.write_str("the last possible id"),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Error)]
    pub enum EngineError {
        #[error("object with id {0} no longer exists")]
        StaleReference(EntityId),
        #[error("id '{raw}' on <{tag}> is {fault}")]
        InvalidIdentifier {
            raw: String,
            tag: &'static str,
            fault: IdFault,
        },
        #[error("object {owner} references unknown object {missing}")]
        DanglingFormula { owner: EntityId, missing: EntityId },
        #[error("document is read-only")]
        ReadOnlyViolation,
        #[error("inconsistent document: {0}")]
        InconsistentDocument(String),
        #[error("a command is already executing")]
        ReentrantCommand,
        #[error("entity with id {0} not found")]
        EntityNotFound(EntityId),
        #[error("object {id} is used by {dependents:?}")]
        EntityInUse {
            id: EntityId,
            dependents: Vec<EntityId>,
        },
        #[error("object {0} cannot be deleted on its own")]
        NotDeletable(EntityId),
        #[error("moving object {0} would break evaluation order")]
        OrderViolation(EntityId),
        #[error("formula would make object {0} depend on itself")]
        CyclicDependency(EntityId),
        #[error("pattern block {0} does not exist")]
        UnknownBlock(usize),
        #[error("group {0} does not exist")]
        UnknownGroup(EntityId),
        #[error("object {id} is already a member of group {group}")]
        AlreadyGroupMember { group: EntityId, id: EntityId },
        #[error("name must not be empty")]
        EmptyName,
        #[error("attribute '{0}' cannot be changed")]
        ProtectedAttribute(String),
        #[error("object {id} is not a {expected}")]
        WrongKind { id: EntityId, expected: EntityKind },
        #[error("no source objects selected")]
        EmptySelection,
        #[error("no free object ids left in this document")]
        IdSpaceExhausted,
        #[error("invalid formula in '{attr}' of object {owner}: {source}")]
        InvalidFormula {
            owner: EntityId,
            attr: String,
            #[source]
            source: FormulaError,
        },
    }

    impl EngineError {
        /// 可在本地恢复的错误：操作被放弃，不产生任何修改，只向用户提示。
        pub fn is_recoverable(&self) -> bool {
            matches!(
                self,
                EngineError::StaleReference(_) | EngineError::ReadOnlyViolation
            )
        }

        /// 前置条件失败：在任何修改发生之前被检测到，文档保持原样。
        pub fn is_precondition(&self) -> bool {
            matches!(
                self,
                EngineError::DanglingFormula { .. }
                    | EngineError::EntityNotFound(_)
                    | EngineError::EntityInUse { .. }
                    | EngineError::NotDeletable(_)
                    | EngineError::OrderViolation(_)
                    | EngineError::CyclicDependency(_)
                    | EngineError::UnknownBlock(_)
                    | EngineError::UnknownGroup(_)
                    | EngineError::AlreadyGroupMember { .. }
                    | EngineError::EmptyName
                    | EngineError::ProtectedAttribute(_)
                    | EngineError::WrongKind { .. }
                    | EngineError::EmptySelection
                    | EngineError::IdSpaceExhausted
                    | EngineError::InvalidFormula { .. }
            )
        }
    }
}
