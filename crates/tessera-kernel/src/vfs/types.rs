//! Core object and argument types.
//!
//! Objects are path-based: drivers hand back [`Obj`] values carrying a
//! storage-relative path, and the operation layer stamps and wraps them
//! before they reach callers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;

/// A file or directory as reported by a driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    /// Stable identifier assigned by the backend (may be empty).
    pub id: String,
    /// Storage-relative path.
    pub path: String,
    /// Entry name (not full path).
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// Last modification time.
    pub modified: SystemTime,
    /// Creation time, when the backend knows it.
    pub created: Option<SystemTime>,
    /// Directory flag.
    pub is_folder: bool,
}

impl Object {
    /// Create a file object.
    pub fn file(name: impl Into<String>, size: u64) -> Self {
        Self {
            id: String::new(),
            path: String::new(),
            name: name.into(),
            size,
            modified: SystemTime::now(),
            created: None,
            is_folder: false,
        }
    }

    /// Create a directory object.
    pub fn folder(name: impl Into<String>) -> Self {
        Self {
            is_folder: true,
            ..Self::file(name, 0)
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_modified(mut self, modified: SystemTime) -> Self {
        self.modified = modified;
        self
    }

    pub fn with_created(mut self, created: SystemTime) -> Self {
        self.created = Some(created);
        self
    }
}

/// Object handle passed between drivers, caches and callers.
///
/// `Named` overrides the display name without touching the shared
/// underlying [`Object`]; [`Obj::unwrapped`] recovers the plain form that
/// drivers expect.
#[derive(Debug, Clone, PartialEq)]
pub enum Obj {
    Plain(Arc<Object>),
    Named { name: String, inner: Arc<Object> },
}

impl Obj {
    pub fn new(object: Object) -> Self {
        Obj::Plain(Arc::new(object))
    }

    /// Wrap with a display name.
    pub fn named(name: impl Into<String>, obj: Obj) -> Self {
        Obj::Named {
            name: name.into(),
            inner: obj.into_object(),
        }
    }

    pub fn object(&self) -> &Arc<Object> {
        match self {
            Obj::Plain(inner) | Obj::Named { inner, .. } => inner,
        }
    }

    fn into_object(self) -> Arc<Object> {
        match self {
            Obj::Plain(inner) | Obj::Named { inner, .. } => inner,
        }
    }

    /// The underlying object without any display-name wrapper.
    pub fn unwrapped(&self) -> Obj {
        Obj::Plain(Arc::clone(self.object()))
    }

    pub fn name(&self) -> &str {
        match self {
            Obj::Plain(inner) => &inner.name,
            Obj::Named { name, .. } => name,
        }
    }

    pub fn id(&self) -> &str {
        &self.object().id
    }

    pub fn path(&self) -> &str {
        &self.object().path
    }

    pub fn size(&self) -> u64 {
        self.object().size
    }

    pub fn modified(&self) -> SystemTime {
        self.object().modified
    }

    /// Creation time, falling back to modification time.
    pub fn created(&self) -> SystemTime {
        let object = self.object();
        object.created.unwrap_or(object.modified)
    }

    pub fn is_dir(&self) -> bool {
        self.object().is_folder
    }

    /// Same handle with the underlying path replaced.
    pub fn with_path(self, path: impl Into<String>) -> Obj {
        let path = path.into();
        match self {
            Obj::Plain(mut inner) => {
                Arc::make_mut(&mut inner).path = path;
                Obj::Plain(inner)
            }
            Obj::Named { name, mut inner } => {
                Arc::make_mut(&mut inner).path = path;
                Obj::Named { name, inner }
            }
        }
    }
}

impl From<Object> for Obj {
    fn from(object: Object) -> Self {
        Obj::new(object)
    }
}

#[derive(Serialize)]
struct ObjView<'a> {
    id: &'a str,
    path: &'a str,
    name: &'a str,
    size: u64,
    modified: SystemTime,
    created: SystemTime,
    is_dir: bool,
}

impl Serialize for Obj {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        ObjView {
            id: self.id(),
            path: self.path(),
            name: self.name(),
            size: self.size(),
            modified: self.modified(),
            created: self.created(),
            is_dir: self.is_dir(),
        }
        .serialize(serializer)
    }
}

/// Display-name remapping table: every occurrence of a key in an object
/// name is replaced by its value.
#[derive(Debug, Clone, Default)]
pub struct NameMapper {
    pairs: Vec<(String, String)>,
}

impl NameMapper {
    pub fn new(map: &BTreeMap<String, String>) -> Self {
        Self {
            pairs: map
                .iter()
                .filter(|(from, _)| !from.is_empty())
                .map(|(from, to)| (from.clone(), to.clone()))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn map_name(&self, name: &str) -> String {
        let mut mapped = name.to_string();
        for (from, to) in &self.pairs {
            if mapped.contains(from.as_str()) {
                mapped = mapped.replace(from.as_str(), to);
            }
        }
        mapped
    }

    /// Apply the table to an object, wrapping only when the name changes.
    pub fn wrap(&self, obj: Obj) -> Obj {
        if self.pairs.is_empty() {
            return obj;
        }
        let mapped = self.map_name(obj.name());
        if mapped == obj.name() {
            obj
        } else {
            Obj::named(mapped, obj)
        }
    }
}

/// Sort objects by `name`, `size` or `modified`; `desc` reverses.
/// Unknown keys leave the order untouched.
pub fn sort_objs(objs: &mut [Obj], order_by: &str, order_direction: &str) {
    match order_by {
        "name" => objs.sort_by(|a, b| a.name().cmp(b.name())),
        "size" => objs.sort_by_key(|o| o.size()),
        "modified" => objs.sort_by_key(|o| o.modified()),
        _ => return,
    }
    if order_direction == "desc" {
        objs.reverse();
    }
}

/// Move folders to the `front` or `back`, keeping relative order.
pub fn extract_folder(objs: &mut [Obj], extract_folder: &str) {
    match extract_folder {
        "front" => objs.sort_by_key(|o| !o.is_dir()),
        "back" => objs.sort_by_key(|o| o.is_dir()),
        _ => {}
    }
}

/// Arguments for a directory listing.
#[derive(Debug, Clone, Default)]
pub struct ListArgs {
    /// Virtual path the caller asked for, for drivers that care.
    pub req_path: String,
    /// Bypass the listing cache.
    pub refresh: bool,
}

/// Arguments for producing a download link.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkArgs {
    pub ip: String,
    pub header: BTreeMap<String, String>,
    /// Driver-specific link flavor; part of the link cache key.
    pub link_type: String,
    pub redirect: bool,
}

/// Arguments handed to a driver's other-call capability.
#[derive(Debug, Clone)]
pub struct OtherArgs {
    pub obj: Obj,
    pub method: String,
    pub data: serde_json::Value,
}

/// Path-level other-call request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FsOtherArgs {
    pub path: String,
    pub method: String,
    #[serde(default)]
    pub data: serde_json::Value,
}
