use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{GuestCall, GuestError};
use crate::{Cdt, Signature, TypeDescriptor};

pub type GuestFn = Arc<dyn Fn(&mut GuestCall<'_, '_>) -> Result<(), GuestError> + Send + Sync>;

pub(crate) type FieldGetter =
    Arc<dyn Fn(&(dyn Any + Send + Sync)) -> Result<Cdt, GuestError> + Send + Sync>;
pub(crate) type FieldSetter =
    Arc<dyn Fn(&(dyn Any + Send + Sync), Cdt) -> Result<(), GuestError> + Send + Sync>;

#[derive(Clone)]
pub(crate) struct FunctionDef {
    pub(crate) signature: Signature,
    pub(crate) body: GuestFn,
}

#[derive(Clone)]
pub(crate) struct MethodDef {
    pub(crate) def: FunctionDef,
    pub(crate) instance: bool,
}

#[derive(Clone)]
pub(crate) struct FieldDef {
    pub(crate) descriptor: TypeDescriptor,
    pub(crate) get: FieldGetter,
    pub(crate) set: Option<FieldSetter>,
}

#[derive(Clone)]
pub(crate) struct AttributeDef {
    pub(crate) descriptor: TypeDescriptor,
    pub(crate) value: Arc<Mutex<Cdt>>,
}

/// A unit of guest code: free functions, classes and module attributes.
#[derive(Default, Clone)]
pub struct LocalModule {
    pub(crate) functions: HashMap<String, FunctionDef>,
    pub(crate) classes: HashMap<String, LocalClass>,
    pub(crate) attributes: HashMap<String, AttributeDef>,
}

impl LocalModule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn function<F>(mut self, name: impl Into<String>, signature: Signature, body: F) -> Self
    where
        F: Fn(&mut GuestCall<'_, '_>) -> Result<(), GuestError> + Send + Sync + 'static,
    {
        self.functions.insert(
            name.into(),
            FunctionDef {
                signature,
                body: Arc::new(body),
            },
        );
        self
    }

    pub fn class(mut self, class: LocalClass) -> Self {
        self.classes.insert(class.name.clone(), class);
        self
    }

    /// A module-level variable, read with `attribute=NAME,getter` and written
    /// with `attribute=NAME,setter`.
    pub fn attribute(
        mut self,
        name: impl Into<String>,
        descriptor: TypeDescriptor,
        initial: impl Into<Cdt>,
    ) -> Self {
        self.attributes.insert(
            name.into(),
            AttributeDef {
                descriptor,
                value: Arc::new(Mutex::new(initial.into())),
            },
        );
        self
    }
}

#[derive(Clone)]
pub struct LocalClass {
    pub(crate) name: String,
    pub(crate) constructor: Option<FunctionDef>,
    pub(crate) methods: HashMap<String, MethodDef>,
    pub(crate) fields: HashMap<String, FieldDef>,
}

impl LocalClass {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            constructor: None,
            methods: HashMap::new(),
            fields: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The handle returned to the caller is whatever the body passes to
    /// [`GuestCall::ret`], normally the result of [`GuestCall::new_object`].
    pub fn constructor<F>(
        mut self,
        params: impl IntoIterator<Item = TypeDescriptor>,
        body: F,
    ) -> Self
    where
        F: Fn(&mut GuestCall<'_, '_>) -> Result<(), GuestError> + Send + Sync + 'static,
    {
        let signature = Signature::new(params, [self.this_type()]);
        self.constructor = Some(FunctionDef {
            signature,
            body: Arc::new(body),
        });
        self
    }

    /// An instance method. `signature` leaves out the receiver, which callers
    /// pass as a leading handle with `instance_required`.
    pub fn method<F>(self, name: impl Into<String>, signature: Signature, body: F) -> Self
    where
        F: Fn(&mut GuestCall<'_, '_>) -> Result<(), GuestError> + Send + Sync + 'static,
    {
        self.add_method(name.into(), signature, Arc::new(body), true)
    }

    pub fn static_method<F>(self, name: impl Into<String>, signature: Signature, body: F) -> Self
    where
        F: Fn(&mut GuestCall<'_, '_>) -> Result<(), GuestError> + Send + Sync + 'static,
    {
        self.add_method(name.into(), signature, Arc::new(body), false)
    }

    fn add_method(
        mut self,
        name: String,
        signature: Signature,
        body: GuestFn,
        instance: bool,
    ) -> Self {
        self.methods.insert(
            name,
            MethodDef {
                def: FunctionDef { signature, body },
                instance,
            },
        );
        self
    }

    /// An instance field of objects of type `T`. Interior mutability in `T`
    /// backs the setter.
    pub fn field<T, G, S>(
        mut self,
        name: impl Into<String>,
        descriptor: TypeDescriptor,
        get: G,
        set: S,
    ) -> Self
    where
        T: Any + Send + Sync,
        G: Fn(&T) -> Cdt + Send + Sync + 'static,
        S: Fn(&T, Cdt) -> Result<(), GuestError> + Send + Sync + 'static,
    {
        let class = self.name.clone();
        let get_class = class.clone();
        let get: FieldGetter = Arc::new(move |object: &(dyn Any + Send + Sync)| {
            downcast_ref::<T>(object, &get_class).map(&get)
        });
        let set: FieldSetter = Arc::new(move |object: &(dyn Any + Send + Sync), value: Cdt| {
            set(downcast_ref::<T>(object, &class)?, value)
        });
        self.fields.insert(
            name.into(),
            FieldDef {
                descriptor,
                get,
                set: Some(set),
            },
        );
        self
    }

    pub fn read_only_field<T, G>(
        mut self,
        name: impl Into<String>,
        descriptor: TypeDescriptor,
        get: G,
    ) -> Self
    where
        T: Any + Send + Sync,
        G: Fn(&T) -> Cdt + Send + Sync + 'static,
    {
        let class = self.name.clone();
        let get: FieldGetter = Arc::new(move |object: &(dyn Any + Send + Sync)| {
            downcast_ref::<T>(object, &class).map(&get)
        });
        self.fields.insert(
            name.into(),
            FieldDef {
                descriptor,
                get,
                set: None,
            },
        );
        self
    }

    pub(crate) fn this_type(&self) -> TypeDescriptor {
        TypeDescriptor::HANDLE.with_alias(self.name.clone())
    }
}

fn downcast_ref<'a, T: Any>(
    object: &'a (dyn Any + Send + Sync),
    class: &str,
) -> Result<&'a T, GuestError> {
    object
        .downcast_ref::<T>()
        .ok_or_else(|| GuestError::new(format!("object is not a `{class}`")))
}
