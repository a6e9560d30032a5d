//! Extension Registry: SPI-style resolution of named plug-ins, an adaptive
//! (URL-dispatching) proxy per extension point, and activation-based
//! selection used by the Filter Chain Builder.
//!
//! Rust has no reflection, so the three operations this module exposes
//! (`get_extension`, `get_adaptive_extension`, `get_activate_extension`)
//! are driven by explicitly registered factory closures rather than by
//! instantiating a class named in a descriptor file. Descriptor discovery
//! ([`descriptor`]) still reads the well-known probe directories and still
//! enforces the same failure modes (missing name, duplicate declaration);
//! it supplies the *set of names* an interface is expected to support, and
//! callers register a Rust factory under each name the descriptors name.

pub mod descriptor;

use std::any::{Any, TypeId};
use std::collections::HashSet;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use fabric_core::Url;
use parking_lot::Mutex;

use crate::{Error, Result};

/// Activation metadata for one name within an extension point: which
/// group it belongs to, which URL keys activate it, and its ordering.
#[derive(Debug, Clone, Default)]
pub struct ActivateMeta {
    /// Empty matches any group (provider/consumer side tag).
    pub group: String,
    /// URL parameter keys; the name activates when at least one is present
    /// and non-empty on the URL passed to `get_activate_extension`.
    pub keys: Vec<String>,
    /// Lower runs first among other activated names; ties keep descriptor order.
    pub order: i32,
}

type Factory<I> = dyn Fn(&ExtensionRegistry) -> Result<Arc<I>> + Send + Sync;
type Decorator<I> = dyn Fn(Arc<I>) -> Arc<I> + Send + Sync;

struct TypedPoint<I: ?Sized> {
    default_name: Mutex<Option<String>>,
    names_in_order: Mutex<Vec<String>>,
    factories: DashMap<String, Arc<Factory<I>>>,
    instances: DashMap<String, Arc<I>>,
    decorators: Mutex<Vec<Arc<Decorator<I>>>>,
    activate: DashMap<String, ActivateMeta>,
    /// Serializes construction per interface — the "first caller performs
    /// load, others block" double-checked init from the concurrency model.
    load_lock: Mutex<()>,
}

impl<I: ?Sized> Default for TypedPoint<I> {
    fn default() -> Self {
        Self {
            default_name: Mutex::new(None),
            names_in_order: Mutex::new(Vec::new()),
            factories: DashMap::new(),
            instances: DashMap::new(),
            decorators: Mutex::new(Vec::new()),
            activate: DashMap::new(),
            load_lock: Mutex::new(()),
        }
    }
}

struct Inner {
    points: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    /// Well-known directories probed, in order, for descriptor files.
    descriptor_dirs: Vec<PathBuf>,
}

/// The process-wide registry of extension points. Cheap to clone — every
/// clone shares the same backing maps.
#[derive(Clone)]
pub struct ExtensionRegistry {
    inner: Arc<Inner>,
}

impl Default for ExtensionRegistry {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl ExtensionRegistry {
    /// Create a registry probing `descriptor_dirs`, in order, when
    /// [`ExtensionRegistry::load_descriptor_names`] is called.
    #[must_use]
    pub fn new(descriptor_dirs: Vec<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                points: DashMap::new(),
                descriptor_dirs,
            }),
        }
    }

    fn point<I: ?Sized + 'static>(&self) -> Arc<TypedPoint<I>> {
        let type_id = TypeId::of::<I>();
        if let Some(existing) = self.inner.points.get(&type_id) {
            return downcast(Arc::clone(existing.value()));
        }
        let created: Arc<TypedPoint<I>> = Arc::new(TypedPoint::default());
        let as_any: Arc<dyn Any + Send + Sync> = created;
        self.inner.points.entry(type_id).or_insert(as_any);
        downcast(Arc::clone(self.inner.points.get(&type_id).expect("just inserted").value()))
    }

    /// Read the descriptor file for `interface_fqn` and record every named
    /// line's name in descriptor order, so a later `get_activate_extension`
    /// sees descriptor order for tie-breaking even before factories are
    /// registered. Bare (unnamed) lines are wrapper/decorator declarations
    /// and are not added to the name list.
    ///
    /// # Errors
    ///
    /// Propagates [`descriptor::load_descriptor`]'s duplicate-name and I/O errors.
    pub fn load_descriptor_names<I: ?Sized + 'static>(&self, interface_fqn: &str) -> Result<()> {
        let lines = descriptor::load_descriptor(&self.inner.descriptor_dirs, interface_fqn)?;
        let point = self.point::<I>();
        let mut order = point.names_in_order.lock();
        for line in lines {
            if let Some(name) = line.name {
                if !order.contains(&name) {
                    order.push(name);
                }
            }
        }
        Ok(())
    }

    /// Register a factory for `name`. Re-registering the same name replaces
    /// the factory but does not evict an already-instantiated singleton.
    pub fn register<I, F>(&self, name: impl Into<String>, factory: F)
    where
        I: ?Sized + 'static,
        F: Fn(&ExtensionRegistry) -> Result<Arc<I>> + Send + Sync + 'static,
    {
        let name = name.into();
        let point = self.point::<I>();
        point.factories.insert(name.clone(), Arc::new(factory));
        let mut order = point.names_in_order.lock();
        if !order.contains(&name) {
            order.push(name);
        }
    }

    /// Register a decorator (wrapper) applied, in registration order, to
    /// every freshly constructed instance of `I` regardless of name.
    pub fn register_decorator<I, F>(&self, decorator: F)
    where
        I: ?Sized + 'static,
        F: Fn(Arc<I>) -> Arc<I> + Send + Sync + 'static,
    {
        self.point::<I>().decorators.lock().push(Arc::new(decorator));
    }

    /// Attach activation metadata to `name`, making it eligible for
    /// automatic inclusion by [`ExtensionRegistry::get_activate_extension`].
    pub fn register_activate<I: ?Sized + 'static>(&self, name: impl Into<String>, meta: ActivateMeta) {
        self.point::<I>().activate.insert(name.into(), meta);
    }

    /// Set the name used when an adaptive lookup finds no URL parameter.
    pub fn set_default_name<I: ?Sized + 'static>(&self, name: impl Into<String>) {
        *self.point::<I>().default_name.lock() = Some(name.into());
    }

    fn default_name<I: ?Sized + 'static>(&self) -> Option<String> {
        self.point::<I>().default_name.lock().clone()
    }

    /// Return the named implementation, constructing it at most once per
    /// (interface, name) and wrapping the fresh instance with every
    /// registered decorator, in registration order.
    ///
    /// # Errors
    ///
    /// [`Error::ExtensionNotFound`] if no factory is registered under `name`;
    /// [`Error::ExtensionInstantiationFailed`] if the factory itself fails.
    pub fn get_extension<I: ?Sized + 'static>(&self, name: &str) -> Result<Arc<I>> {
        let point = self.point::<I>();
        if let Some(existing) = point.instances.get(name) {
            return Ok(Arc::clone(existing.value()));
        }

        let _guard = point.load_lock.lock();
        if let Some(existing) = point.instances.get(name) {
            return Ok(Arc::clone(existing.value()));
        }

        let interface = std::any::type_name::<I>();
        let factory = point
            .factories
            .get(name)
            .map(|f| Arc::clone(f.value()))
            .ok_or_else(|| Error::ExtensionNotFound {
                interface: interface.to_string(),
                name: name.to_string(),
            })?;

        let mut instance = factory(self).map_err(|e| Error::ExtensionInstantiationFailed {
            interface: interface.to_string(),
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        for decorator in point.decorators.lock().iter() {
            instance = decorator(instance);
        }

        point.instances.insert(name.to_string(), Arc::clone(&instance));
        Ok(instance)
    }

    /// Build an adaptive proxy for `I` that, given a URL, reads `param_key`
    /// (falling back to the interface's default name) to pick which
    /// registered name to resolve and delegate to.
    #[must_use]
    pub fn get_adaptive_extension<I: ?Sized + 'static>(&self, param_key: impl Into<String>) -> AdaptiveExtension<I> {
        AdaptiveExtension {
            registry: self.clone(),
            param_key: param_key.into(),
            _marker: PhantomData,
        }
    }

    /// Ordered union of the activated set (names whose metadata matches
    /// `group` and at least one activation key is a non-empty parameter on
    /// `url`) and the explicit `names` list. A `"default"` entry in `names`
    /// marks where the activated set is spliced in; otherwise the activated
    /// set comes first. A `"-name"` entry excludes that name from the
    /// activated set.
    ///
    /// # Errors
    ///
    /// Propagates [`ExtensionRegistry::get_extension`] failures for any
    /// resolved name.
    pub fn get_activate_extension<I: ?Sized + 'static>(
        &self,
        url: &Url,
        names: &[String],
        group: Option<&str>,
    ) -> Result<Vec<Arc<I>>> {
        let point = self.point::<I>();

        let excluded: HashSet<&str> = names
            .iter()
            .filter_map(|n| n.strip_prefix('-'))
            .collect();
        let explicit: Vec<&str> = names
            .iter()
            .map(String::as_str)
            .filter(|n| !n.starts_with('-') && *n != "default")
            .collect();

        let mut activated: Vec<(i32, String)> = Vec::new();
        for name in point.names_in_order.lock().iter() {
            if excluded.contains(name.as_str()) || explicit.contains(&name.as_str()) {
                continue;
            }
            let Some(meta) = point.activate.get(name) else {
                continue;
            };
            if let Some(g) = group {
                if !meta.group.is_empty() && meta.group != g {
                    continue;
                }
            }
            let matches = meta.keys.is_empty()
                || meta.keys.iter().any(|k| !url.parameter(k, "").is_empty());
            if matches {
                activated.push((meta.order, name.clone()));
            }
        }
        activated.sort_by_key(|(order, _)| *order);

        let has_default_marker = names.iter().any(|n| n == "default");
        let mut resolved_names: Vec<String> = Vec::new();
        if has_default_marker {
            for n in names {
                if n == "default" {
                    resolved_names.extend(activated.iter().map(|(_, name)| name.clone()));
                } else if !n.starts_with('-') {
                    resolved_names.push(n.clone());
                }
            }
        } else {
            resolved_names.extend(activated.into_iter().map(|(_, name)| name));
            resolved_names.extend(explicit.into_iter().map(str::to_string));
        }

        resolved_names.iter().map(|n| self.get_extension::<I>(n)).collect()
    }
}

fn downcast<I: ?Sized + 'static>(any: Arc<dyn Any + Send + Sync>) -> Arc<TypedPoint<I>> {
    any.downcast::<TypedPoint<I>>()
        .unwrap_or_else(|_| unreachable!("TypeId-keyed map invariant violated"))
}

/// A per-interface dispatcher that resolves the implementation to call by
/// reading a URL parameter, the Rust stand-in for a dynamically synthesized
/// adaptive class (see the design note on generic indexed dispatch).
pub struct AdaptiveExtension<I: ?Sized + 'static> {
    registry: ExtensionRegistry,
    param_key: String,
    _marker: PhantomData<fn() -> Arc<I>>,
}

impl<I: ?Sized + 'static> AdaptiveExtension<I> {
    /// Resolve against `url`'s `param_key` parameter, falling back to the
    /// interface's default name.
    ///
    /// # Errors
    ///
    /// [`Error::ExtensionNotFound`] when neither the URL nor a default name
    /// supplies a name, or the resolved name has no registered factory.
    pub fn resolve(&self, url: &Url) -> Result<Arc<I>> {
        let name = url
            .parameter_opt(&self.param_key)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .or_else(|| self.registry.default_name::<I>())
            .ok_or_else(|| Error::ExtensionNotFound {
                interface: std::any::type_name::<I>().to_string(),
                name: format!("<missing '{}' parameter>", self.param_key),
            })?;
        self.registry.get_extension::<I>(&name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Car: Send + Sync {
        fn get_car_name(&self, url: &Url) -> String;
    }

    struct BlackCar;
    impl Car for BlackCar {
        fn get_car_name(&self, _url: &Url) -> String {
            "BlackCar".to_string()
        }
    }

    trait Person: Send + Sync {
        fn name(&self) -> &'static str;
    }
    struct WhitePerson;
    impl Person for WhitePerson {
        fn name(&self) -> &'static str {
            "WhitePerson"
        }
    }
    struct BlackPerson;
    impl Person for BlackPerson {
        fn name(&self) -> &'static str {
            "BlackPerson"
        }
    }

    #[test]
    fn adaptive_dispatch_resolves_by_url_parameter() {
        let registry = ExtensionRegistry::default();
        registry.register::<dyn Car, _>("black", |_| Ok(Arc::new(BlackCar)));

        let adaptive = registry.get_adaptive_extension::<dyn Car>("car");
        let url = Url::parse("x://localhost:8080?car=black").unwrap();
        let car = adaptive.resolve(&url).unwrap();

        assert_eq!(car.get_car_name(&url), "BlackCar");
    }

    #[test]
    fn get_extension_returns_the_same_instance_across_calls() {
        let registry = ExtensionRegistry::default();
        registry.register::<dyn Car, _>("black", |_| Ok(Arc::new(BlackCar)));

        let a = registry.get_extension::<dyn Car>("black").unwrap();
        let b = registry.get_extension::<dyn Car>("black").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn get_extension_missing_name_is_an_error() {
        let registry = ExtensionRegistry::default();
        let err = registry.get_extension::<dyn Car>("nonexistent").unwrap_err();
        assert!(matches!(err, Error::ExtensionNotFound { .. }));
    }

    #[test]
    fn activate_selection_matches_on_url_parameter_and_group() {
        let registry = ExtensionRegistry::default();
        registry.register::<dyn Person, _>("white", |_| Ok(Arc::new(WhitePerson)));
        registry.register::<dyn Person, _>("black", |_| Ok(Arc::new(BlackPerson)));
        registry.register_activate::<dyn Person>(
            "white",
            ActivateMeta {
                group: String::new(),
                keys: vec!["person".to_string()],
                order: 0,
            },
        );

        let url = Url::parse("x://h:1?person=white").unwrap();

        let none_explicit = registry.get_activate_extension::<dyn Person>(&url, &[], None).unwrap();
        assert_eq!(none_explicit.iter().map(|p| p.name()).collect::<Vec<_>>(), vec!["WhitePerson"]);

        let with_black = registry
            .get_activate_extension::<dyn Person>(&url, &["black".to_string()], None)
            .unwrap();
        assert_eq!(
            with_black.iter().map(|p| p.name()).collect::<Vec<_>>(),
            vec!["WhitePerson", "BlackPerson"]
        );
    }

    #[test]
    fn decorators_wrap_every_fresh_instance() {
        struct Wrapped<I: ?Sized>(Arc<I>);
        impl Car for Wrapped<dyn Car> {
            fn get_car_name(&self, url: &Url) -> String {
                format!("Wrapped({})", self.0.get_car_name(url))
            }
        }

        let registry = ExtensionRegistry::default();
        registry.register::<dyn Car, _>("black", |_| Ok(Arc::new(BlackCar)));
        registry.register_decorator::<dyn Car, _>(|inner| Arc::new(Wrapped(inner)) as Arc<dyn Car>);

        let car = registry.get_extension::<dyn Car>("black").unwrap();
        assert_eq!(car.get_car_name(&Url::parse("x://h").unwrap()), "Wrapped(BlackCar)");
    }
}
