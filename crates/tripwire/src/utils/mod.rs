// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

/// Generates an `Fn`-like wrapper type with consistent behavior.
///
/// The generated type stores the function as an `Arc<dyn Fn>`, providing
/// `Clone`, a name-only `Debug`, and `new`/`call` methods. User-provided
/// functions (operations, classifiers, callbacks) are stored this way so
/// they stay thread-safe and cheaply clonable without leaking generic
/// parameters into the types that hold them.
macro_rules! define_fn_wrapper {
    ($name:ident<$($generics:ident),*>(Fn($($param_name:ident: $param_ty:ty),*) -> $return_ty:ty)) => {
        pub(crate) struct $name<$($generics),*>(
            std::sync::Arc<dyn Fn($($param_ty),*) -> $return_ty + Send + Sync>,
        );

        impl<$($generics),*> $name<$($generics),*> {
            pub(crate) fn new<F>(f: F) -> Self
            where
                F: Fn($($param_ty),*) -> $return_ty + Send + Sync + 'static,
            {
                Self(std::sync::Arc::new(f))
            }

            pub(crate) fn call(&self, $($param_name: $param_ty),*) -> $return_ty {
                (self.0)($($param_name),*)
            }
        }

        impl<$($generics),*> Clone for $name<$($generics),*> {
            fn clone(&self) -> Self {
                Self(std::sync::Arc::clone(&self.0))
            }
        }

        impl<$($generics),*> std::fmt::Debug for $name<$($generics),*> {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($name)).finish()
            }
        }
    };

    ($name:ident<$($generics:ident),*>(Fn($($param_name:ident: $param_ty:ty),*))) => {
        $crate::utils::define_fn_wrapper!($name<$($generics),*>(Fn($($param_name: $param_ty),*) -> ()));
    };
}

pub(crate) use define_fn_wrapper;
