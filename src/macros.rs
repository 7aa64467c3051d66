/// Declares a typed wrapper around a [`RemoteObject`](crate::RemoteObject).
///
/// ```ignore
/// remote_interface! {
///     pub struct Calculator {
///         fn add(a: i64, b: i64) -> i64;
///         fn reset() -> ();
///         property count: i64;
///         signal count_changed as "countChanged";
///     }
/// }
///
/// let calc = Calculator::bind(channel.object("calc").unwrap());
/// let sum = calc.add(2, 3).await?;
/// ```
///
/// Methods come first, then properties, then signals. `as "name"` gives the
/// remote member name when it differs from the Rust identifier.
#[macro_export]
macro_rules! remote_interface {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $(
                fn $method:ident $(as $method_remote:literal)? ( $($arg:ident : $arg_ty:ty),* $(,)? ) -> $ret:ty;
            )*
            $(
                property $prop:ident $(as $prop_remote:literal)? : $prop_ty:ty;
            )*
            $(
                signal $sig:ident $(as $sig_remote:literal)?;
            )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Debug)]
        $vis struct $name {
            object: $crate::RemoteObject,
        }

        impl $name {
            pub fn bind(object: $crate::RemoteObject) -> Self {
                Self { object }
            }

            pub fn object(&self) -> &$crate::RemoteObject {
                &self.object
            }

            $(
                pub async fn $method(&self $(, $arg: $arg_ty)*) -> ::std::result::Result<$ret, $crate::CallError> {
                    let args: ::std::vec::Vec<$crate::Value> =
                        ::std::vec![$($crate::RemoteObject::encode_arg(&$arg)?),*];
                    self.object
                        .call_as::<$ret, _>($crate::__remote_name!($method $(, $method_remote)?), args)
                        .await
                }
            )*

            $(
                pub fn $prop(&self) -> $crate::PropertyRef<'_, $prop_ty> {
                    $crate::PropertyRef::new(&self.object, $crate::__remote_name!($prop $(, $prop_remote)?))
                }
            )*

            $(
                pub fn $sig(&self) -> $crate::SignalRef<'_> {
                    $crate::SignalRef::new(&self.object, $crate::__remote_name!($sig $(, $sig_remote)?))
                }
            )*
        }
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __remote_name {
    ($ident:ident) => {
        stringify!($ident)
    };
    ($ident:ident, $remote:literal) => {
        $remote
    };
}
