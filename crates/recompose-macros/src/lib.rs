//! `#[composable]`: turns a plain function into a restartable, skippable
//! composable.
//!
//! A composable with a `()` return and owned parameters that are
//! `Clone + PartialEq + 'static` gets the skipping expansion:
//!
//! ```text
//! start_restartable_group(call site key)
//! changed = changed(&arg0) | changed(&arg1) | ...
//! if should_execute(changed) { body(args) } else { skip_current_group() }
//! end_restartable_group()  -> scope.set_recompose(recall args, body)
//! ```
//!
//! Parameters are stored in the group's first slots, so the recompose
//! callback can recall them when only this scope is re-run. Everything else
//! (return values, borrowed or `impl Trait` parameters, closures, or
//! `#[composable(no_skip)]`) runs in a restartable group that always executes
//! and leaves restarting to the enclosing scope.

use proc_macro::TokenStream;
use proc_macro2::{Span, TokenStream as TokenStream2};
use quote::{format_ident, quote};
use syn::spanned::Spanned;
use syn::{
    parse_macro_input, FnArg, GenericParam, Generics, Ident, ItemFn, PatType, ReturnType,
    Type, TypeParamBound, WherePredicate,
};

fn is_fn_trait(bound: &TypeParamBound) -> bool {
    let TypeParamBound::Trait(trait_bound) = bound else {
        return false;
    };
    trait_bound
        .path
        .segments
        .last()
        .is_some_and(|segment| matches!(segment.ident.to_string().as_str(), "Fn" | "FnMut" | "FnOnce"))
}

/// `impl Fn(..)`, `Box<dyn Fn(..)>`, `Rc<dyn Fn(..)>`, `fn(..)` and the like.
fn is_fn_like_type(ty: &Type) -> bool {
    match ty {
        Type::ImplTrait(impl_trait) => impl_trait.bounds.iter().any(is_fn_trait),
        Type::TraitObject(object) => object.bounds.iter().any(is_fn_trait),
        Type::BareFn(_) => true,
        Type::Paren(inner) => is_fn_like_type(&inner.elem),
        Type::Path(path) => path.path.segments.last().is_some_and(|segment| {
            let syn::PathArguments::AngleBracketed(args) = &segment.arguments else {
                return false;
            };
            args.args.iter().any(|arg| match arg {
                syn::GenericArgument::Type(inner) => is_fn_like_type(inner),
                _ => false,
            })
        }),
        _ => false,
    }
}

/// A type parameter bounded by a closure trait, inline or in the where
/// clause.
fn is_generic_fn_like(ty: &Type, generics: &Generics) -> bool {
    let Type::Path(path) = ty else {
        return false;
    };
    let Some(ident) = path.path.get_ident() else {
        return false;
    };
    let inline = generics.params.iter().any(|param| match param {
        GenericParam::Type(param) => param.ident == *ident && param.bounds.iter().any(is_fn_trait),
        _ => false,
    });
    let in_where = generics.where_clause.as_ref().is_some_and(|clause| {
        clause.predicates.iter().any(|predicate| match predicate {
            WherePredicate::Type(predicate) => {
                matches!(&predicate.bounded_ty, Type::Path(bounded) if bounded.path.is_ident(ident))
                    && predicate.bounds.iter().any(is_fn_trait)
            }
            _ => false,
        })
    });
    inline || in_where
}

fn contains_reference(ty: &Type) -> bool {
    match ty {
        Type::Reference(_) => true,
        Type::Paren(inner) => contains_reference(&inner.elem),
        Type::Tuple(tuple) => tuple.elems.iter().any(contains_reference),
        Type::Slice(slice) => contains_reference(&slice.elem),
        Type::Array(array) => contains_reference(&array.elem),
        Type::Path(path) => path.path.segments.iter().any(|segment| match &segment.arguments {
            syn::PathArguments::AngleBracketed(args) => args.args.iter().any(|arg| match arg {
                syn::GenericArgument::Type(inner) => contains_reference(inner),
                syn::GenericArgument::Lifetime(_) => true,
                _ => false,
            }),
            _ => false,
        }),
        _ => false,
    }
}

struct Param {
    ident: Ident,
    ty: Type,
}

impl Param {
    /// Whether the value can be stored in a slot and compared across passes.
    fn storable(&self, generics: &Generics) -> bool {
        !matches!(self.ty, Type::ImplTrait(_))
            && !is_fn_like_type(&self.ty)
            && !is_generic_fn_like(&self.ty, generics)
            && !contains_reference(&self.ty)
    }
}

enum Mode {
    Skip,
    NoSkip,
}

fn parse_mode(attr: TokenStream2) -> syn::Result<Mode> {
    if attr.is_empty() {
        return Ok(Mode::Skip);
    }
    let ident: Ident = syn::parse2(attr)?;
    if ident == "no_skip" {
        Ok(Mode::NoSkip)
    } else {
        Err(syn::Error::new_spanned(
            ident,
            "unsupported composable attribute; expected `no_skip`",
        ))
    }
}

/// Type and const parameters, in order, for an explicit turbofish. Lifetimes
/// are left to inference.
fn turbofish(generics: &Generics) -> TokenStream2 {
    let args: Vec<&Ident> = generics
        .params
        .iter()
        .filter_map(|param| match param {
            GenericParam::Type(param) => Some(&param.ident),
            GenericParam::Const(param) => Some(&param.ident),
            GenericParam::Lifetime(_) => None,
        })
        .collect();
    if args.is_empty() {
        quote! {}
    } else {
        quote! { ::<#(#args),*> }
    }
}

#[proc_macro_attribute]
pub fn composable(attr: TokenStream, item: TokenStream) -> TokenStream {
    let mode = match parse_mode(attr.into()) {
        Ok(mode) => mode,
        Err(err) => return err.to_compile_error().into(),
    };
    let func = parse_macro_input!(item as ItemFn);
    match expand(mode, func) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand(mode: Mode, func: ItemFn) -> syn::Result<TokenStream2> {
    if let Some(asyncness) = &func.sig.asyncness {
        return Err(syn::Error::new_spanned(
            asyncness,
            "composable functions cannot be async; use launched_effect for async work",
        ));
    }

    let mut params = Vec::new();
    let mut wrapper = func.clone();
    for (index, arg) in wrapper.sig.inputs.iter_mut().enumerate() {
        match arg {
            FnArg::Receiver(receiver) => {
                return Err(syn::Error::new(
                    receiver.span(),
                    "composable functions cannot take `self`",
                ));
            }
            FnArg::Typed(PatType { pat, ty, .. }) => {
                let ident = format_ident!("__arg{}", index);
                *pat = Box::new(syn::parse_quote! { #ident });
                params.push(Param {
                    ident,
                    ty: ty.as_ref().clone(),
                });
            }
        }
    }

    let name = &func.sig.ident;
    let generics = &func.sig.generics;
    let (impl_generics, _, where_clause) = generics.split_for_impl();
    let returns_unit = match &func.sig.output {
        ReturnType::Default => true,
        ReturnType::Type(_, ty) => matches!(ty.as_ref(), Type::Tuple(tuple) if tuple.elems.is_empty()),
    };
    let has_lifetimes = generics.lifetimes().next().is_some();
    let skippable = matches!(mode, Mode::Skip)
        && returns_unit
        && !has_lifetimes
        && params.iter().all(|param| param.storable(generics));

    // The user's body, unchanged, behind its own function so `return`
    // cannot jump over the end of the group.
    let body_ident = format_ident!("__recompose_body_{}", name);
    let mut body_fn = func.clone();
    body_fn.sig.ident = body_ident.clone();
    body_fn.vis = syn::Visibility::Inherited;
    body_fn.attrs.retain(|attr| !attr.path().is_ident("doc"));

    let idents: Vec<&Ident> = params.iter().map(|param| &param.ident).collect();
    let has_impl_trait = params
        .iter()
        .any(|param| matches!(param.ty, Type::ImplTrait(_)));
    let body_call = if has_impl_trait {
        quote! { #body_ident(#(#idents),*) }
    } else {
        let fish = turbofish(generics);
        quote! { #body_ident #fish (#(#idents),*) }
    };

    let key = quote! {
        let __caller = ::core::panic::Location::caller();
        let __key = ::recompose_core::location_key(
            __caller.file(),
            __caller.line(),
            __caller.column(),
        );
    };

    let (block, recompose_fn) = if skippable {
        let recompose_ident = format_ident!("__recompose_restart_{}", name);
        let fish = turbofish(generics);
        let types: Vec<&Type> = params.iter().map(|param| &param.ty).collect();
        let recall_idents: Vec<Ident> = (0..params.len())
            .map(|index| Ident::new(&format!("__recalled{index}"), Span::call_site()))
            .collect();
        let recompose_fn = quote! {
            #[doc(hidden)]
            #[allow(non_snake_case)]
            fn #recompose_ident #impl_generics (__composer: &::recompose_core::Composer) #where_clause {
                #(let #recall_idents = __composer.recall::<#types>();)*
                #body_ident #fish (#(#recall_idents),*)
            }
        };
        let skipping = quote! {{
            #key
            ::recompose_core::with_current_composer(|__composer: &::recompose_core::Composer| {
                __composer.start_restartable_group(__key);
                #[allow(unused_mut)]
                let mut __changed = false;
                #(__changed |= __composer.changed(&#idents);)*
                if __composer.should_execute(__changed) {
                    #body_call;
                } else {
                    __composer.skip_current_group();
                }
                if let Some(__scope) = __composer.end_restartable_group() {
                    __scope.set_recompose(move |__composer: &::recompose_core::Composer| {
                        #recompose_ident #fish (__composer)
                    });
                }
            })
        }};
        (skipping, Some(recompose_fn))
    } else {
        let always = quote! {{
            #key
            ::recompose_core::with_current_composer(|__composer: &::recompose_core::Composer| {
                __composer.restartable_group(__key, |_| #body_call)
            })
        }};
        (always, None)
    };

    wrapper.block = Box::new(syn::parse2(block)?);
    wrapper.attrs.push(syn::parse_quote! { #[track_caller] });

    Ok(quote! {
        #[doc(hidden)]
        #[allow(non_snake_case, clippy::too_many_arguments)]
        #body_fn
        #recompose_fn
        #wrapper
    })
}
