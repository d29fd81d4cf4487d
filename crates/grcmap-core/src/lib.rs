//! GRC mapping engine
//!
//! Keeps, for any object, live lists of the objects mapped to it:
//!
//! ```text
//! ┌──────────────┐   get_binding    ┌─────────────┐   on_add / on_remove
//! │   Mappings   │ ───────────────► │ ListBinding │ ──────────────────────► UI
//! │  (registry)  │   ListLoader     │  (results)  │
//! └──────────────┘                  └─────────────┘
//!        ▲                                ▲
//!        │ TypeMappings                   │ model events, source bindings
//!        │                                │
//!   reference config              MappingContext (cache, fetcher, queries)
//! ```
//!
//! ## Pieces
//!
//! - **Results**: a mapped object plus the chain of results that explains
//!   why it is in the list. Lists merge by object and union provenance.
//! - **Loaders**: composable recipes (direct, proxy, multi, filters, cross,
//!   reify, search) that build and maintain a binding.
//! - **Registry**: per-type mappings with mixins, canonical names and the
//!   map/create/unmap rules.
//! - **Mapper**: the search behind the "map objects" dialog.
//!
//! Bindings are driven by a tokio runtime: refreshes are futures, and
//! several loaders react to events by spawning tasks. Attach those loaders
//! from inside a runtime.

pub mod binding;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod instance;
pub mod loader;
pub mod mapper;
pub mod mappings;
pub mod merge;
pub mod models;
pub mod prefs;
pub mod reference;
pub mod refresh_queue;
pub mod result;
pub mod snapshot;

pub use binding::{ListBinding, ResultBatch};
pub use config::EngineConfig;
pub use context::{MappingContext, MappingContextBuilder, QueryService};
pub use error::{ConfigError, LoadError, MapperError};
pub use events::{EventHub, ModelEvent, ModelEvents, Subscription};
pub use instance::{Attributes, Instance, InstanceCache, InstanceKey, InstanceRegistry, SNAPSHOT_TYPE};
pub use loader::{
    filter_fn, ListLoader, QueryFilter, RelevantSearch, ResultFilter, SearchQuery, SourceRef,
};
pub use mapper::{MapperItem, MapperPage, MapperQuery, ObjectMapper};
pub use mappings::{
    cross, custom_filter, direct, multi, proxy, reify, search, stub_filter, type_filter, Action,
    AllowAll, MapSubject, Mappings, MappingsBuilder, PermissionOracle, TypeMappings,
};
pub use merge::{insert_results, is_duplicate_result, remove_instance};
pub use models::{ModelDescriptor, ModelRegistry, TreeColumn, TreeViewConfig, TypeGroups};
pub use prefs::{DisplayPrefs, FilePrefsStorage, MemoryPrefsStorage, PrefsStorage, SortState};
pub use refresh_queue::{InstanceFetcher, RefreshQueue};
pub use result::{MappingResult, Subject};
