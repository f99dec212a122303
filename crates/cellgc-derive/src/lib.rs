//! Derive macro for the `cellgc::Trace` trait.
//!
//! The generated impl reports every field from `trace` and forwards
//! `detach` to every field, so a node type's edges are both found by the
//! collector and severed when the node is swept.

use proc_macro2::TokenStream;
use quote::{format_ident, quote, quote_spanned};
use syn::{
    parse_macro_input, parse_quote, spanned::Spanned, Data, DeriveInput, Fields, GenericParam,
    Generics, Ident, Index, Path,
};

/// Derive `Trace` for a struct or enum whose fields all implement `Trace`.
///
/// The path to the `cellgc` crate can be overridden with
/// `#[cellgc(crate = "path::to::cellgc")]`.
#[proc_macro_derive(Trace, attributes(cellgc))]
pub fn derive_trace(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let mut krate: Path = parse_quote!(::cellgc);

    for attr in &input.attrs {
        if !attr.path().is_ident("cellgc") {
            continue;
        }

        let result = attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("crate") {
                let lit: syn::LitStr = meta.value()?.parse()?;
                krate = lit.parse()?;
                Ok(())
            } else {
                Err(meta.error("unsupported attribute"))
            }
        });

        if let Err(err) = result {
            return err.into_compile_error().into();
        }
    }

    if let Data::Union(u) = &input.data {
        return quote_spanned! {
            u.union_token.span => compile_error!("`Trace` must be manually implemented for unions");
        }
        .into();
    }

    let name = &input.ident;
    let generics = add_trait_bounds(&krate, input.generics.clone());
    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();
    let trace = format_ident!("trace");
    let detach = format_ident!("detach");
    let trace_body = generate_body(&krate, name, &input.data, &trace, &quote!(visitor));
    let detach_body = generate_body(&krate, name, &input.data, &detach, &quote!());

    let generated = quote! {
        unsafe impl #impl_generics #krate::Trace for #name #ty_generics #where_clause {
            #[inline]
            #[allow(unused_variables)]
            fn trace(&self, visitor: &mut dyn #krate::Visitor) {
                #trace_body
            }

            #[inline]
            fn detach(&self) {
                #detach_body
            }
        }
    };

    generated.into()
}

fn add_trait_bounds(krate: &Path, mut generics: Generics) -> Generics {
    for param in &mut generics.params {
        if let GenericParam::Type(ref mut type_param) = *param {
            let has_trace = type_param.bounds.iter().any(|b| {
                if let syn::TypeParamBound::Trait(t) = b {
                    t.path.segments.last().is_some_and(|s| s.ident == "Trace")
                } else {
                    false
                }
            });
            if !has_trace {
                type_param.bounds.push(parse_quote!(#krate::Trace));
            }
        }
    }
    generics
}

/// Call `Trace::#method(field, #args)` on every field of `data`.
fn generate_body(
    krate: &Path,
    name: &Ident,
    data: &Data,
    method: &Ident,
    args: &TokenStream,
) -> TokenStream {
    let call = |field: TokenStream, span: proc_macro2::Span| {
        quote_spanned! {span =>
            #krate::Trace::#method(#field, #args);
        }
    };

    match data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(f) => {
                let calls = f.named.iter().map(|field| {
                    let ident = &field.ident;
                    call(quote!(&self.#ident), field.span())
                });
                quote! { #(#calls)* }
            }
            Fields::Unnamed(f) => {
                let calls = f.unnamed.iter().enumerate().map(|(i, field)| {
                    let index = Index::from(i);
                    call(quote!(&self.#index), field.span())
                });
                quote! { #(#calls)* }
            }
            Fields::Unit => quote! {},
        },
        Data::Enum(data) => {
            let arms = data.variants.iter().map(|variant| {
                let var_name = &variant.ident;
                match &variant.fields {
                    Fields::Named(f) => {
                        let bindings: Vec<_> = (0..f.named.len())
                            .map(|i| format_ident!("field{}", i))
                            .collect();
                        let idents = f.named.iter().map(|f| &f.ident);
                        let calls = bindings
                            .iter()
                            .zip(f.named.iter())
                            .map(|(binding, field)| call(quote!(#binding), field.span()));
                        quote! {
                            #name::#var_name { #(#idents: #bindings),* } => {
                                #(#calls)*
                            }
                        }
                    }
                    Fields::Unnamed(f) => {
                        let bindings: Vec<_> = (0..f.unnamed.len())
                            .map(|i| format_ident!("field{}", i))
                            .collect();
                        let calls = bindings
                            .iter()
                            .zip(f.unnamed.iter())
                            .map(|(binding, field)| call(quote!(#binding), field.span()));
                        quote! {
                            #name::#var_name(#(#bindings),*) => {
                                #(#calls)*
                            }
                        }
                    }
                    Fields::Unit => quote! {
                        #name::#var_name => {}
                    },
                }
            });
            quote! {
                match self {
                    #(#arms)*
                }
            }
        }
        Data::Union(_) => quote! {},
    }
}
