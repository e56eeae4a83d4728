//! Host interfaces implemented by script tables.
//!
//! An [`InterfaceContract`] names a set of methods. A [`ScriptProxy`] binds
//! one script table (or host object) to one or more contracts and builds a
//! capability table once, at construction: every `(contract, method)` pair
//! maps to the table field it dispatches to, its arity and its return shape.
//! Calls then go through that table with receiver-first method calls.
//!
//! [`script_interface!`](crate::script_interface) declares a Rust trait plus
//! its contract, so host code can use a script table through a typed API:
//!
//! ```ignore
//! luabridge_core::script_interface! {
//!     pub trait Shape [SHAPE = "Shape"] {
//!         fn area(&self) -> f64 = "area";
//!         fn scale(&self, factor: f64) -> () = "scale";
//!     }
//! }
//! ```

use crate::callable::HostFunction;
use crate::error::{BridgeError, Result};
use crate::host_object::HostObject;
use crate::protocol::ResultCount;
use crate::reference::ManagedReference;
use crate::value::{FromHostValue, HostValue, ValueKind};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// What a contract method gives back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnShape {
    Void,
    /// The first result, `nil` when the script returns nothing
    Single,
}

impl ReturnShape {
    fn result_count(self) -> ResultCount {
        match self {
            Self::Void => ResultCount::Exactly(0),
            Self::Single => ResultCount::Exactly(1),
        }
    }
}

/// One method of an [`InterfaceContract`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSignature {
    /// Name host code calls the method by
    pub name: Cow<'static, str>,
    /// Table field the call dispatches to
    pub field: Cow<'static, str>,
    /// Number of arguments, not counting the receiver
    pub params: usize,
    pub returns: ReturnShape,
}

impl MethodSignature {
    pub const fn new_static(
        name: &'static str,
        field: &'static str,
        params: usize,
        returns: ReturnShape,
    ) -> Self {
        Self {
            name: Cow::Borrowed(name),
            field: Cow::Borrowed(field),
            params,
            returns,
        }
    }
}

/// A named set of method signatures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceContract {
    pub name: Cow<'static, str>,
    pub methods: Cow<'static, [MethodSignature]>,
}

impl InterfaceContract {
    pub const fn new_static(name: &'static str, methods: &'static [MethodSignature]) -> Self {
        Self {
            name: Cow::Borrowed(name),
            methods: Cow::Borrowed(methods),
        }
    }

    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Cow::Owned(name.into()),
            methods: Cow::Owned(Vec::new()),
        }
    }

    /// Add a method dispatching to the field of the same name.
    pub fn method(self, name: impl Into<String>, params: usize, returns: ReturnShape) -> Self {
        let name = name.into();
        self.method_with_field(name.clone(), name, params, returns)
    }

    /// Add a method dispatching to `field`.
    pub fn method_with_field(
        mut self,
        name: impl Into<String>,
        field: impl Into<String>,
        params: usize,
        returns: ReturnShape,
    ) -> Self {
        self.methods.to_mut().push(MethodSignature {
            name: Cow::Owned(name.into()),
            field: Cow::Owned(field.into()),
            params,
            returns,
        });
        self
    }

    pub fn find(&self, method: &str) -> Option<&MethodSignature> {
        self.methods.iter().find(|signature| signature.name == method)
    }

    fn validate(&self) -> Result<()> {
        crate::error::require_name("contract name", &self.name)?;
        for (i, signature) in self.methods.iter().enumerate() {
            crate::error::require_name("method name", &signature.name)?;
            crate::error::require_name("method field", &signature.field)?;
            if self.methods[..i].iter().any(|earlier| earlier.name == signature.name) {
                return Err(BridgeError::illegal(format!(
                    "contract {} declares method {} twice",
                    self.name, signature.name
                )));
            }
        }
        Ok(())
    }
}

/// Contracts known to the host, by name.
#[derive(Debug, Clone, Default)]
pub struct InterfaceCatalog {
    contracts: HashMap<String, InterfaceContract>,
}

impl InterfaceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, contract: InterfaceContract) -> Result<()> {
        contract.validate()?;
        let name = contract.name.to_string();
        if self.contracts.contains_key(&name) {
            return Err(BridgeError::illegal(format!(
                "contract {name} is already registered"
            )));
        }
        self.contracts.insert(name, contract);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&InterfaceContract> {
        self.contracts.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.contracts.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.contracts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }
}

#[derive(Debug, Clone)]
struct MethodBinding {
    field: String,
    params: usize,
    returns: ReturnShape,
}

/// A script table seen through one or more host contracts.
pub struct ScriptProxy {
    target: ManagedReference,
    contracts: Vec<String>,
    bindings: HashMap<String, HashMap<String, MethodBinding>>,
}

impl ScriptProxy {
    /// Bind `target` to the named contracts, resolving each in `catalog`.
    pub fn new(target: ManagedReference, catalog: &InterfaceCatalog, contracts: &[&str]) -> Result<Self> {
        let kind = target.kind()?;
        if !matches!(kind, ValueKind::Table | ValueKind::HostObject) {
            return Err(BridgeError::illegal(format!(
                "a proxy needs a table or host object, found {kind}"
            )));
        }
        if contracts.is_empty() {
            return Err(BridgeError::illegal("a proxy needs at least one contract"));
        }

        let mut bindings = HashMap::new();
        let mut names = Vec::with_capacity(contracts.len());
        for &requested in contracts {
            let contract = catalog
                .get(requested)
                .ok_or_else(|| BridgeError::InterfaceResolution {
                    contract: requested.to_string(),
                    method: None,
                })?;
            let methods = contract
                .methods
                .iter()
                .map(|signature| {
                    let binding = MethodBinding {
                        field: signature.field.to_string(),
                        params: signature.params,
                        returns: signature.returns,
                    };
                    (signature.name.to_string(), binding)
                })
                .collect::<HashMap<_, _>>();
            bindings.insert(contract.name.to_string(), methods);
            names.push(contract.name.to_string());
        }

        tracing::debug!(
            key = %target.key(),
            contracts = ?names,
            "script proxy bound"
        );
        Ok(Self {
            target,
            contracts: names,
            bindings,
        })
    }

    /// Like [`new`](Self::new) with contract names given as `"A, B"`.
    pub fn from_spec(target: ManagedReference, catalog: &InterfaceCatalog, list: &str) -> Result<Self> {
        let names: Vec<&str> = list
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .collect();
        Self::new(target, catalog, &names)
    }

    pub fn implements(&self, contract: &str) -> bool {
        self.bindings.contains_key(contract)
    }

    pub fn contracts(&self) -> impl Iterator<Item = &str> {
        self.contracts.iter().map(String::as_str)
    }

    /// The table (or host object) calls are dispatched to.
    pub fn target(&self) -> &ManagedReference {
        &self.target
    }

    /// Call `contract.method(args...)` on the script side.
    ///
    /// Returns no values for `Void` methods and exactly one for `Single`.
    pub fn invoke(&self, contract: &str, method: &str, args: &[HostValue]) -> Result<Vec<HostValue>> {
        let binding = self
            .bindings
            .get(contract)
            .and_then(|methods| methods.get(method))
            .ok_or_else(|| BridgeError::InterfaceResolution {
                contract: contract.to_string(),
                method: Some(method.to_string()),
            })?;
        if args.len() != binding.params {
            return Err(BridgeError::illegal(format!(
                "{contract}.{method} takes {} arguments, got {}",
                binding.params,
                args.len()
            )));
        }
        self.target
            .call_method(&binding.field, args, binding.returns.result_count())
    }

    /// [`invoke`](Self::invoke) with the result converted to `R`.
    pub fn invoke_typed<R: FromHostValues>(
        &self,
        contract: &str,
        method: &str,
        args: &[HostValue],
    ) -> Result<R> {
        R::from_results(self.invoke(contract, method, args)?)
    }

    /// Release the proxied table now instead of on drop.
    pub fn release(self) -> Result<()> {
        self.target.release()
    }
}

impl fmt::Debug for ScriptProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptProxy")
            .field("target", &self.target)
            .field("contracts", &self.contracts)
            .finish()
    }
}

/// Conversion of a method's results into its declared return type.
pub trait FromHostValues: Sized {
    const SHAPE: ReturnShape;

    fn from_results(results: Vec<HostValue>) -> Result<Self>;
}

impl FromHostValues for () {
    const SHAPE: ReturnShape = ReturnShape::Void;

    fn from_results(_results: Vec<HostValue>) -> Result<Self> {
        Ok(())
    }
}

macro_rules! single_result {
    ($($ty:ty),* $(,)?) => {
        $(
            impl FromHostValues for $ty {
                const SHAPE: ReturnShape = ReturnShape::Single;

                fn from_results(results: Vec<HostValue>) -> Result<Self> {
                    let first = results.into_iter().next().unwrap_or(HostValue::Nil);
                    <$ty as FromHostValue>::from_host_value(first)
                }
            }
        )*
    };
}

single_result!(
    HostValue,
    bool,
    f64,
    f32,
    i64,
    i32,
    u32,
    String,
    ManagedReference,
    Arc<dyn HostObject>,
    HostFunction,
);

impl<T: FromHostValue> FromHostValues for Option<T> {
    const SHAPE: ReturnShape = ReturnShape::Single;

    fn from_results(results: Vec<HostValue>) -> Result<Self> {
        let first = results.into_iter().next().unwrap_or(HostValue::Nil);
        Option::<T>::from_host_value(first)
    }
}

#[doc(hidden)]
#[macro_export]
macro_rules! __count_params {
    () => { 0usize };
    ($head:ident $($tail:ident)*) => { 1usize + $crate::__count_params!($($tail)*) };
}

/// Declare a host trait implemented by [`ScriptProxy`], together with the
/// `const` [`InterfaceContract`] describing it.
///
/// Each method names the table field it dispatches to. Return types must
/// implement [`FromHostValues`]; `()` declares a `Void` method.
#[macro_export]
macro_rules! script_interface {
    (
        $(#[$meta:meta])*
        $vis:vis trait $trait_name:ident [$contract:ident = $contract_name:literal] {
            $(
                $(#[$method_meta:meta])*
                fn $method:ident(&self $(, $arg:ident : $arg_ty:ty)*) -> $ret:ty = $field:literal;
            )*
        }
    ) => {
        $vis const $contract: $crate::InterfaceContract = {
            const METHODS: &[$crate::MethodSignature] = &[
                $(
                    $crate::MethodSignature::new_static(
                        stringify!($method),
                        $field,
                        $crate::__count_params!($($arg)*),
                        <$ret as $crate::FromHostValues>::SHAPE,
                    ),
                )*
            ];
            $crate::InterfaceContract::new_static($contract_name, METHODS)
        };

        $(#[$meta])*
        $vis trait $trait_name {
            $(
                $(#[$method_meta])*
                fn $method(&self $(, $arg: $arg_ty)*) -> $crate::Result<$ret>;
            )*
        }

        impl $trait_name for $crate::ScriptProxy {
            $(
                fn $method(&self $(, $arg: $arg_ty)*) -> $crate::Result<$ret> {
                    let args: ::std::vec::Vec<$crate::HostValue> =
                        ::std::vec![$($crate::HostValue::from($arg)),*];
                    self.invoke_typed($contract_name, stringify!($method), &args)
                }
            )*
        }
    };
}
