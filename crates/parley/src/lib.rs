//! High-level type adapters and callable wrapping for the Parley RPC core.
//!
//! [`parley_core::Endpoint`] only ever sees already-encoded [`WireValue`]
//! byte slots; it has no notion of "a Rust `String`" or "a user struct".
//! This crate bridges that gap: an [`Adapter`] describes how one such
//! non-primitive type round-trips through a `VARY` (or other primitive)
//! slot, and [`wrap`] lifts a plain Rust closure with a declared signature
//! into the `(arg_sig, ret_sig, handler)` triple [`Endpoint::add_func`]
//! expects — performing the decode/invoke/encode dance and turning a
//! panicking or erroring callable into an `EXCEPTION` reply.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

use parley_alloc::AllocError;
use parley_codec::{PrimitiveValue, Reader, Writer};
use parley_wire::ErrorCode;

pub use parley_core::{Endpoint, EndpointConfig, TypeTag, WireValue};

/// Errors raised by an [`Adapter`]'s `dumps`/`loads`. These are local
/// (host-side) errors; the call site that triggered them maps them onto
/// `ErrorCode::Exception`, since a failure of the adapter's own codec
/// observed while servicing a call is the callable's problem, not a
/// framing one.
#[derive(Debug)]
pub enum AdapterError {
    /// `loads` was handed bytes that don't decode to the adapter's value
    /// type (e.g. `StringType` given non-UTF-8 bytes).
    Invalid(String),
}

impl fmt::Display for AdapterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterError::Invalid(msg) => write!(f, "adapter decode failed: {msg}"),
        }
    }
}

impl std::error::Error for AdapterError {}

/// A paired `dumps`/`loads`/`underlying_type` helper letting a host-language
/// value that isn't itself a wire primitive travel as one signature slot.
/// `StringType` is the only built-in adapter; hosts implement this trait for
/// their own types.
pub trait Adapter {
    /// The decoded host-language value.
    type Value;

    /// Which primitive tag this adapter's encoded form occupies on the
    /// wire. Typically [`TypeTag::Vary`].
    fn underlying_type(&self) -> TypeTag;

    /// Host value -> wire-compatible bytes for `underlying_type()`.
    fn dumps(&self, value: &Self::Value) -> Result<Vec<u8>, AdapterError>;

    /// Wire-compatible bytes for `underlying_type()` -> host value.
    fn loads(&self, wire: &[u8]) -> Result<Self::Value, AdapterError>;
}

/// The built-in string adapter: `underlying_type = VARY`, UTF-8 only.
///
/// A configurable-encoding version would need a `Self::Value` that varies
/// with the encoding, which doesn't fit one monomorphic `Adapter` impl
/// cleanly; see `DESIGN.md` for why the encoding knob was dropped rather
/// than generalised.
#[derive(Debug, Default, Clone, Copy)]
pub struct StringType;

impl Adapter for StringType {
    type Value = String;

    fn underlying_type(&self) -> TypeTag {
        TypeTag::Vary
    }

    fn dumps(&self, value: &String) -> Result<Vec<u8>, AdapterError> {
        Ok(value.as_bytes().to_vec())
    }

    fn loads(&self, wire: &[u8]) -> Result<String, AdapterError> {
        String::from_utf8(wire.to_vec()).map_err(|e| AdapterError::Invalid(e.to_string()))
    }
}

/// A type-erased [`Adapter`], so heterogeneous adapters (a `StringType`
/// here, a user-defined adapter there) can sit side by side in one
/// signature. Blanket-implemented for every `Adapter` whose `Value` is
/// `'static`; hosts never implement this directly.
trait DynAdapter {
    fn underlying_type(&self) -> TypeTag;
    fn dumps_any(&self, value: &dyn Any) -> Result<Vec<u8>, AdapterError>;
    fn loads_any(&self, wire: &[u8]) -> Result<Box<dyn Any>, AdapterError>;
}

impl<A> DynAdapter for A
where
    A: Adapter,
    A::Value: 'static,
{
    fn underlying_type(&self) -> TypeTag {
        Adapter::underlying_type(self)
    }

    fn dumps_any(&self, value: &dyn Any) -> Result<Vec<u8>, AdapterError> {
        let value = value
            .downcast_ref::<A::Value>()
            .expect("DynAdapter::dumps_any called with the wrong concrete type");
        self.dumps(value)
    }

    fn loads_any(&self, wire: &[u8]) -> Result<Box<dyn Any>, AdapterError> {
        Ok(Box::new(self.loads(wire)?))
    }
}

/// One slot of a declared signature: either a bare primitive, passed
/// through untouched, or an adapter that decodes/encodes a richer Rust
/// value around a primitive wire form.
pub enum SigSlot {
    Primitive(TypeTag),
    Adapter(Box<dyn DynAdapter>),
}

impl SigSlot {
    /// Wrap any [`Adapter`] as a signature slot.
    pub fn adapter<A>(adapter: A) -> Self
    where
        A: Adapter + 'static,
        A::Value: 'static,
    {
        SigSlot::Adapter(Box::new(adapter))
    }

    fn underlying_tag(&self) -> TypeTag {
        match self {
            SigSlot::Primitive(tag) => *tag,
            SigSlot::Adapter(a) => a.underlying_type(),
        }
    }

    fn decode(&self, raw: &WireValue) -> Result<Decoded, ErrorCode> {
        match self {
            SigSlot::Primitive(tag) => {
                let mut r = Reader::new(raw);
                let value = r.read_primitive(*tag).map_err(|_| ErrorCode::BrokenMsg)?;
                Ok(Decoded::Primitive(value))
            }
            SigSlot::Adapter(a) => {
                let value = a.loads_any(raw).map_err(|_| ErrorCode::Exception)?;
                Ok(Decoded::Adapted(value))
            }
        }
    }

    fn encode(&self, value: &Decoded) -> Result<WireValue, ErrorCode> {
        match (self, value) {
            (SigSlot::Primitive(tag), Decoded::Primitive(v)) => {
                if v.tag() != *tag {
                    return Err(ErrorCode::SigIncorrect);
                }
                let mut w = Writer::new();
                w.write_primitive(*v);
                Ok(w.into_bytes())
            }
            (SigSlot::Adapter(a), Decoded::Adapted(v)) => {
                a.dumps_any(v.as_ref()).map_err(|_| ErrorCode::Exception)
            }
            _ => Err(ErrorCode::SigIncorrect),
        }
    }
}

impl From<TypeTag> for SigSlot {
    fn from(tag: TypeTag) -> Self {
        SigSlot::Primitive(tag)
    }
}

/// One decoded argument or return value passed to/from a wrapped callable:
/// either a primitive at its final Rust width, or an adapter-decoded value
/// erased behind `Box<dyn Any>` (downcast with [`Decoded::downcast`]).
pub enum Decoded {
    Primitive(PrimitiveValue),
    Adapted(Box<dyn Any>),
}

impl Decoded {
    /// Build a decoded slot from any primitive value.
    pub fn primitive(value: impl Into<PrimitiveValue>) -> Self {
        Decoded::Primitive(value.into())
    }

    /// Build a decoded slot from any adapter-shaped value (e.g. a `String`
    /// destined for a `StringType` return slot).
    pub fn adapted<T: 'static>(value: T) -> Self {
        Decoded::Adapted(Box::new(value))
    }

    /// Widen a primitive slot to `i64`, or `None` if this is an adapted slot.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Decoded::Primitive(v) => Some(v.as_i64()),
            Decoded::Adapted(_) => None,
        }
    }

    /// Borrow an adapted slot as `T`, or `None` if this is a primitive slot
    /// or `T` doesn't match the value that was actually stored.
    pub fn downcast<T: 'static>(&self) -> Option<&T> {
        match self {
            Decoded::Adapted(v) => v.downcast_ref::<T>(),
            Decoded::Primitive(_) => None,
        }
    }
}

macro_rules! impl_into_primitive_value {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for PrimitiveValue {
                fn from(v: $ty) -> Self {
                    PrimitiveValue::$variant(v)
                }
            }
        )*
    };
}

impl_into_primitive_value! {
    i8 => I8, u8 => U8, i16 => I16, u16 => U16,
    i32 => I32, u32 => U32, i64 => I64, u64 => U64,
}

/// Coerces a wrapped callable's return value into the `Vec<Decoded>` the
/// endpoint needs, so callables can return whatever shape is natural —
/// nothing (`()`), a single value, or several — without the caller having
/// to build a `Vec` by hand.
pub trait IntoResults {
    fn into_results(self) -> Vec<Decoded>;
}

impl IntoResults for () {
    fn into_results(self) -> Vec<Decoded> {
        vec![]
    }
}

impl IntoResults for Decoded {
    fn into_results(self) -> Vec<Decoded> {
        vec![self]
    }
}

impl IntoResults for Vec<Decoded> {
    fn into_results(self) -> Vec<Decoded> {
        self
    }
}

/// Lift a plain Rust closure with a declared argument/return signature into
/// the `(arg_sig, ret_sig, handler)` triple [`Endpoint::add_func`] expects.
///
/// Computes the underlying signatures from `arg_slots`/`ret_slots`, decodes
/// each incoming argument per its slot, invokes `f`, and encodes each
/// returned value per its slot. A panic inside `f`, or an explicit `Err`,
/// becomes `ErrorCode::Exception`; a return whose arity doesn't match
/// `ret_slots` is also `Exception` (the callable's own contract violation,
/// distinct from `SigIncorrect`, which is reserved for signature mismatches
/// the *caller* is responsible for).
///
/// The declared-vs-underlying argument signature check is performed by
/// [`Endpoint::recv`] itself before a registered handler is ever invoked (it
/// compares the inbound `CALL`'s signature against the one `add_func`
/// recorded), so `wrap`'s handler doesn't repeat it — there would be
/// nothing left to check by the time it runs.
pub fn wrap<R>(
    arg_slots: Vec<SigSlot>,
    ret_slots: Vec<SigSlot>,
    f: impl Fn(&[Decoded]) -> Result<R, String> + 'static,
) -> WrappedFunc
where
    R: IntoResults + 'static,
{
    let arg_sig: Vec<TypeTag> = arg_slots.iter().map(SigSlot::underlying_tag).collect();
    let ret_sig: Vec<TypeTag> = ret_slots.iter().map(SigSlot::underlying_tag).collect();

    let handler = move |raw_args: &[WireValue]| -> Result<Vec<WireValue>, ErrorCode> {
        let decoded: Vec<Decoded> = raw_args
            .iter()
            .zip(&arg_slots)
            .map(|(raw, slot)| slot.decode(raw))
            .collect::<Result<_, _>>()?;

        let outcome = catch_unwind(AssertUnwindSafe(|| f(&decoded)));
        let results = match outcome {
            Err(_panic) => return Err(ErrorCode::Exception),
            Ok(Err(_msg)) => return Err(ErrorCode::Exception),
            Ok(Ok(r)) => r.into_results(),
        };

        if results.len() != ret_slots.len() {
            return Err(ErrorCode::Exception);
        }
        results
            .iter()
            .zip(&ret_slots)
            .map(|(value, slot)| slot.encode(value))
            .collect()
    };

    WrappedFunc {
        arg_sig,
        ret_sig,
        handler: Box::new(handler),
    }
}

/// The product of [`wrap`]: the triple [`Endpoint::add_func`] needs. Kept
/// as a named struct (rather than a bare tuple) so [`EndpointExt::add_typed_func`]
/// reads as "register this wrapped function" at the call site.
pub struct WrappedFunc {
    pub arg_sig: Vec<TypeTag>,
    pub ret_sig: Vec<TypeTag>,
    pub handler: Box<dyn FnMut(&[WireValue]) -> Result<Vec<WireValue>, ErrorCode>>,
}

/// A macro-free, fluent alternative to building `arg_slots`/`ret_slots`
/// vectors by hand. Declaring a signature and wrapping the callable
/// collapse into a single step here: `SignatureBuilder::build` both records
/// the signature and wraps the callable in one call.
#[derive(Default)]
pub struct SignatureBuilder {
    arg_slots: Vec<SigSlot>,
    ret_slots: Vec<SigSlot>,
}

impl SignatureBuilder {
    pub fn new() -> Self {
        SignatureBuilder::default()
    }

    pub fn arg(mut self, slot: impl Into<SigSlot>) -> Self {
        self.arg_slots.push(slot.into());
        self
    }

    pub fn ret(mut self, slot: impl Into<SigSlot>) -> Self {
        self.ret_slots.push(slot.into());
        self
    }

    pub fn build<R>(self, f: impl Fn(&[Decoded]) -> Result<R, String> + 'static) -> WrappedFunc
    where
        R: IntoResults + 'static,
    {
        wrap(self.arg_slots, self.ret_slots, f)
    }
}

impl From<StringType> for SigSlot {
    fn from(adapter: StringType) -> Self {
        SigSlot::adapter(adapter)
    }
}

/// Registration convenience bridging [`WrappedFunc`] into
/// [`Endpoint::add_func`], as an extension trait since `Endpoint` lives in
/// a different crate and can't grow an inherent method here.
pub trait EndpointExt {
    fn add_typed_func(
        &self,
        name: impl Into<String>,
        wrapped: WrappedFunc,
    ) -> Result<u32, AllocError>;

    /// Outbound counterpart to [`EndpointExt::add_typed_func`]: for each
    /// `arg_slots`/`ret_slots` element that's an adapter rather than a bare
    /// primitive, `args[i]` is encoded (`dumps`) before the `CALL` frame is
    /// built, and each returned wire value is decoded (`loads`) per
    /// `ret_slots` before `callback` sees it — so a caller invoking a
    /// remote `StringType`-typed function works with host values on both
    /// ends, the same way [`wrap`] does for the callee side.
    ///
    /// If any argument fails to encode, `callback` is invoked synchronously
    /// with that error and no frame is sent; the returned message id is `0`
    /// in that case, since none was allocated.
    fn call_typed(
        &self,
        handle: u32,
        arg_slots: Vec<SigSlot>,
        args: Vec<Decoded>,
        ret_slots: Vec<SigSlot>,
        callback: impl FnOnce(Result<Vec<Decoded>, ErrorCode>) + 'static,
    ) -> u16;
}

impl EndpointExt for Endpoint {
    fn add_typed_func(
        &self,
        name: impl Into<String>,
        wrapped: WrappedFunc,
    ) -> Result<u32, AllocError> {
        self.add_func(Some(name), wrapped.arg_sig, wrapped.ret_sig, wrapped.handler)
    }

    fn call_typed(
        &self,
        handle: u32,
        arg_slots: Vec<SigSlot>,
        args: Vec<Decoded>,
        ret_slots: Vec<SigSlot>,
        callback: impl FnOnce(Result<Vec<Decoded>, ErrorCode>) + 'static,
    ) -> u16 {
        let arg_sig: Vec<TypeTag> = arg_slots.iter().map(SigSlot::underlying_tag).collect();
        let encoded: Result<Vec<WireValue>, ErrorCode> = args
            .iter()
            .zip(&arg_slots)
            .map(|(value, slot)| slot.encode(value))
            .collect();
        let encoded = match encoded {
            Ok(values) => values,
            Err(code) => {
                callback(Err(code));
                return 0;
            }
        };

        self.call(handle, &arg_sig, encoded, move |result| {
            let decoded = result.and_then(|raw_values| {
                if raw_values.len() != ret_slots.len() {
                    return Err(ErrorCode::SigIncorrect);
                }
                raw_values
                    .iter()
                    .zip(&ret_slots)
                    .map(|(raw, slot)| slot.decode(raw))
                    .collect::<Result<Vec<Decoded>, ErrorCode>>()
            });
            callback(decoded);
        })
    }
}
