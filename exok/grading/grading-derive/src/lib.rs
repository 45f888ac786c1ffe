use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote_spanned;
use syn::{Expr, Ident, ItemFn, parse_macro_input, spanned::Spanned};

/// Turns `fn name(env: &mut E)` into a `#[test]` that runs the body as the
/// root environment of a fresh kernel, then checks its exit code and that
/// every physical page was released.
///
/// `E` is built from the environment's `EnvCtx` through `From`. The root
/// environment exits with `0` when the body returns.
#[proc_macro_attribute]
pub fn assert_exit_code(attr: TokenStream, item: TokenStream) -> TokenStream {
    let code = parse_macro_input!(attr as Expr);
    let input_fn = parse_macro_input!(item as ItemFn);
    let span = input_fn.span();
    let name = input_fn.sig.ident.clone();
    let attrs = input_fn.attrs;
    let vis = input_fn.vis;
    let block = input_fn.block;
    let mut body_sig = input_fn.sig;
    body_sig.ident = Ident::new("__body", Span::call_site());

    TokenStream::from(quote_spanned! { span =>
        #(#attrs)*
        #[test]
        #vis fn #name() {
            #body_sig #block

            let outcome = ::grading::run(
                ::exok::KernelConfig::new().quiet(true),
                concat!(module_path!(), "::", stringify!(#name)),
                |ctx| {
                    let mut env = ::core::convert::From::from(ctx);
                    __body(&mut env);
                    0
                },
            );
            assert_eq!(outcome.exit_code, #code, "exit code of `{}`", stringify!(#name));
            assert_eq!(outcome.pages_leaked, 0, "pages leaked by `{}`", stringify!(#name));
        }
    })
}
