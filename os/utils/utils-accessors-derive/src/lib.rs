//! # Accessor Derive
//!
//! Builder-style setters for the plain configuration and permission structs
//! of the memory manager (`MemoryManagerConfig`, `PageFlags`, region access).

use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::{
    Attribute, Data, DeriveInput, Fields, LitBool, Token, parse_macro_input, spanned::Spanned,
};

/// Derive to generate `.set_<field>(&mut self, value: Ty) -> &mut Self` and
/// `const .with_<field>(mut self, value: Ty) -> Self` for each **named** field.
///
/// Options, on a field or on the whole struct:
/// - `#[setters(skip)]` / `#[setters(skip = true)]`: no accessors at all.
/// - `#[setters(with_only)]`: only the consuming `with_` form, for value
///   types that are never edited in place.
///
/// # Example
///
/// ```
/// use utils_accessors_derive::Setters;
///
/// #[derive(Setters)]
/// struct Foo<T> where T: Default {
///     a: u32,
///     #[setters(with_only)]
///     b: bool,
///     #[setters(skip)]
///     _phantom: T,
/// }
///
/// let mut f = Foo { a: 1, b: false, _phantom: u8::default() };
/// f.set_a(10).set_a(11);
/// let f2 = f.with_a(42).with_b(true);
/// assert_eq!(f2.a, 42);
/// assert!(f2.b);
/// ```
#[proc_macro_derive(Setters, attributes(setters))]
pub fn derive_generate_setters(input: TokenStream) -> TokenStream {
    let DeriveInput {
        ident,
        generics,
        data,
        attrs,
        ..
    } = parse_macro_input!(input as DeriveInput);

    let fields = match data {
        Data::Struct(s) => match s.fields {
            Fields::Named(n) => n.named,
            Fields::Unnamed(u) => {
                return syn::Error::new(u.span(), "Setters only supports named fields")
                    .to_compile_error()
                    .into();
            }
            Fields::Unit => {
                return syn::Error::new(ident.span(), "Setters does not apply to unit structs")
                    .to_compile_error()
                    .into();
            }
        },
        _ => {
            return syn::Error::new(ident.span(), "Setters can only be derived for structs")
                .to_compile_error()
                .into();
        }
    };

    let defaults = match SetterOptions::parse(&attrs, SetterOptions::default()) {
        Ok(o) => o,
        Err(e) => return e.to_compile_error().into(),
    };

    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

    let mut methods = Vec::new();
    for field in fields {
        let Some(fname) = &field.ident else { continue };
        let options = match SetterOptions::parse(&field.attrs, defaults) {
            Ok(o) => o,
            Err(e) => return e.to_compile_error().into(),
        };
        if options.skip {
            continue;
        }

        let ty = &field.ty;
        let with_name = format_ident!("with_{}", fname);
        let with_doc = format!("Returns `self` with `{fname}` replaced.");
        methods.push(quote! {
            #[doc = #with_doc]
            #[inline]
            #[must_use]
            pub const fn #with_name(mut self, value: #ty) -> Self {
                self.#fname = value;
                self
            }
        });

        if !options.with_only {
            let set_name = format_ident!("set_{}", fname);
            let set_doc = format!("Sets `{fname}` in place.");
            methods.push(quote! {
                #[doc = #set_doc]
                #[inline]
                pub fn #set_name(&mut self, value: #ty) -> &mut Self {
                    self.#fname = value;
                    self
                }
            });
        }
    }

    let expanded = quote! {
        impl #impl_generics #ident #ty_generics #where_clause {
            #(#methods)*
        }
    };

    TokenStream::from(expanded)
}

/// Parsed `#[setters(...)]` options.
#[derive(Clone, Copy, Default)]
struct SetterOptions {
    skip: bool,
    with_only: bool,
}

impl SetterOptions {
    /// Apply every `#[setters(...)]` attribute in `attrs` on top of `inherited`.
    fn parse(attrs: &[Attribute], inherited: Self) -> syn::Result<Self> {
        let mut options = inherited;
        for attr in attrs.iter().filter(|a| a.path().is_ident("setters")) {
            attr.parse_nested_meta(|meta| {
                let enabled = if meta.input.peek(Token![=]) {
                    meta.value()?.parse::<LitBool>()?.value
                } else {
                    true
                };
                if meta.path.is_ident("skip") {
                    options.skip = enabled;
                } else if meta.path.is_ident("with_only") {
                    options.with_only = enabled;
                } else {
                    return Err(meta.error("expected `skip` or `with_only`"));
                }
                Ok(())
            })?;
        }
        Ok(options)
    }
}
