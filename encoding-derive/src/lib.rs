//! `#[derive(GuestValue)]`: generates [`dbgcore_encoding::Encode`],
//! [`dbgcore_encoding::Decode`], [`dbgcore_encoding::EncodedSize`] and
//! [`dbgcore_encoding::NaturalAlign`] impls for a struct of guest-value
//! fields.
//!
//! The struct is always marshalled indirectly: the argument stream gets a
//! single pointer word, and fields are written into the pointee block at
//! their natural offsets, computed at macro-expansion time from each
//! field's `encoded_size`/`natural_align` calls — which themselves take the
//! ABI's pointer size as a runtime argument, since the same struct has a
//! different block size on ARM and ARM64.
//!
//! A field tagged `#[guest(skip)]` is left out of the wire layout entirely:
//! it is not read, not written, and reconstructed with `Default::default()`
//! on decode. The type must implement `Default`.

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Data, DeriveInput, Fields};

fn is_skipped(attrs: &[syn::Attribute]) -> bool {
    attrs.iter().any(|attr| {
        if !attr.path().is_ident("guest") {
            return false;
        }
        let mut skip = false;
        let _ = attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("skip") {
                skip = true;
            }
            Ok(())
        });
        skip
    })
}

#[proc_macro_derive(GuestValue, attributes(guest))]
pub fn derive_guest_value(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let fields = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(named) => &named.named,
            _ => {
                return syn::Error::new_spanned(
                    &input,
                    "GuestValue only supports structs with named fields",
                )
                .to_compile_error()
                .into()
            }
        },
        _ => {
            return syn::Error::new_spanned(&input, "GuestValue only supports structs")
                .to_compile_error()
                .into()
        }
    };

    let mut wire_idents = Vec::new();
    let mut wire_types = Vec::new();
    let mut skip_idents = Vec::new();

    for field in fields.iter() {
        let ident = field.ident.clone().expect("named field");
        if is_skipped(&field.attrs) {
            skip_idents.push(ident);
        } else {
            wire_idents.push(ident);
            wire_types.push(field.ty.clone());
        }
    }

    let size_align_pairs: Vec<_> = wire_types.iter().map(|ty| {
        quote! { (<#ty as ::dbgcore_encoding::EncodedSize>::encoded_size(pointer_size), <#ty as ::dbgcore_encoding::NaturalAlign>::natural_align(pointer_size)) }
    }).collect();

    let encode_fields: Vec<_> = wire_idents.iter().enumerate().map(|(i, ident)| {
        quote! {
            {
                let mut field_stream = ::dbgcore_encoding::BlockStream::new(stream, addr + offsets[#i] as u64);
                ::dbgcore_encoding::Encode::encode(&self.#ident, &mut field_stream)?;
            }
        }
    }).collect();

    let decode_fields: Vec<_> = wire_idents.iter().enumerate().map(|(i, ident)| {
        quote! {
            let #ident = {
                let mut field_stream = ::dbgcore_encoding::BlockStream::new(stream, addr + offsets[#i] as u64);
                ::dbgcore_encoding::Decode::decode(&mut field_stream)?
            };
        }
    }).collect();

    let skip_defaults: Vec<_> = skip_idents.iter().map(|ident| {
        quote! { let #ident = ::core::default::Default::default(); }
    }).collect();

    let all_idents: Vec<_> = wire_idents.iter().chain(skip_idents.iter()).collect();

    let expanded = quote! {
        impl #impl_generics ::dbgcore_encoding::EncodedSize for #name #ty_generics #where_clause {
            fn encoded_size(pointer_size: usize) -> usize {
                let fields: &[(usize, usize)] = &[#(#size_align_pairs),*];
                ::dbgcore_encoding::layout_struct(fields).max(pointer_size)
            }
        }

        impl #impl_generics ::dbgcore_encoding::NaturalAlign for #name #ty_generics #where_clause {
            fn natural_align(pointer_size: usize) -> usize {
                let fields: &[(usize, usize)] = &[#(#size_align_pairs),*];
                fields.iter().map(|&(_, a)| a).max().unwrap_or(1).max(1).min(pointer_size.max(1))
            }
        }

        impl #impl_generics ::dbgcore_encoding::Encode for #name #ty_generics #where_clause {
            fn encode(&self, stream: &mut dyn ::dbgcore_encoding::Stream) -> ::dbgcore_encoding::Result<()> {
                let pointer_size = stream.pointer_size();
                let fields: &[(usize, usize)] = &[#(#size_align_pairs),*];
                let size = ::dbgcore_encoding::layout_struct(fields).max(pointer_size);
                let align = fields.iter().map(|&(_, a)| a).max().unwrap_or(1).max(1);
                let offsets = ::dbgcore_encoding::field_offsets(fields);
                let addr = stream.alloc(size, align)?;
                #(#encode_fields)*
                stream.write_word(&addr.to_le_bytes()[..pointer_size])
            }
        }

        impl #impl_generics ::dbgcore_encoding::Decode for #name #ty_generics #where_clause {
            fn decode(stream: &mut dyn ::dbgcore_encoding::Stream) -> ::dbgcore_encoding::Result<Self> {
                let pointer_size = stream.pointer_size();
                let fields: &[(usize, usize)] = &[#(#size_align_pairs),*];
                let offsets = ::dbgcore_encoding::field_offsets(fields);
                let addr_bytes = stream.read_word(pointer_size)?;
                let mut buf = [0u8; 8];
                buf[..pointer_size].copy_from_slice(&addr_bytes);
                let addr = u64::from_le_bytes(buf);
                #(#decode_fields)*
                #(#skip_defaults)*
                Ok(Self { #(#all_idents),* })
            }
        }
    };

    expanded.into()
}
