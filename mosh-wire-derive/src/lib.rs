mod deserialize;
mod serialize;
mod size;

use proc_macro::TokenStream;
use quote::quote;
use syn::{DeriveInput, parse_macro_input};

#[proc_macro_derive(MoshSerialize, attributes(mosh))]
pub fn derive_mosh_serialize(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let mut expanded = size::derive_mosh_size_impl(input.clone());
    expanded.extend(serialize::derive_mosh_serialize_impl(input));
    expanded = quote! {
        const _: () = {
            #[allow(unused_imports)]
            use ::mosh_wire::{MoshSerialize as _, MoshSize as _};
            #[allow(unused_imports)]
            use ::std::io::Write as _;
            #expanded
        };
    };
    TokenStream::from(expanded)
}

#[proc_macro_derive(MoshDeserialize, attributes(mosh))]
pub fn derive_mosh_deserialize(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let mut expanded = size::derive_mosh_size_impl(input.clone());
    expanded.extend(deserialize::derive_mosh_deserialize_impl(input));
    expanded = quote! {
        const _: () = {
            #[allow(unused_imports)]
            use ::mosh_wire::{MoshDeserialize as _, MoshSize as _};
            #[allow(unused_imports)]
            use ::std::io::Read as _;
            #expanded
        };
    };
    TokenStream::from(expanded)
}

#[proc_macro_derive(MoshWire, attributes(mosh))]
pub fn derive_mosh_wire(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let mut expanded = size::derive_mosh_size_impl(input.clone());
    expanded.extend(serialize::derive_mosh_serialize_impl(input.clone()));
    expanded.extend(deserialize::derive_mosh_deserialize_impl(input));
    expanded = quote! {
        const _: () = {
            #[allow(unused_imports)]
            use ::mosh_wire::{MoshSerialize as _, MoshDeserialize as _, MoshSize as _};
            #[allow(unused_imports)]
            use ::std::io::{Read as _, Write as _};
            #expanded
        };
    };
    TokenStream::from(expanded)
}
