use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::punctuated::Punctuated;
use syn::{parse_macro_input, Attribute, Expr, ExprLit, ExprPath, ItemFn, Lit, Token};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Arguments accepted by both attributes: an optional timeout in seconds and,
/// for async tests, the `paused` flag which starts the Tokio clock paused.
struct TimeoutArgs {
    timeout_secs: u64,
    paused: bool,
}

impl Parse for TimeoutArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut args = TimeoutArgs {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            paused: false,
        };
        let items = Punctuated::<Expr, Token![,]>::parse_terminated(input)?;
        for item in items {
            match &item {
                Expr::Lit(ExprLit {
                    lit: Lit::Int(lit), ..
                }) => {
                    let secs: u64 = lit.base10_parse()?;
                    if secs == 0 {
                        return Err(syn::Error::new_spanned(
                            lit,
                            "timeout must be greater than zero",
                        ));
                    }
                    args.timeout_secs = secs;
                }
                Expr::Path(ExprPath { path, .. }) if path.is_ident("paused") => {
                    args.paused = true;
                }
                other => {
                    return Err(syn::Error::new_spanned(
                        other,
                        "expected a timeout in seconds or `paused`",
                    ));
                }
            }
        }
        Ok(args)
    }
}

/// Runs an async test on a current-thread runtime inside a watchdog thread.
///
/// `#[tokio_timeout_test]`, `#[tokio_timeout_test(10)]` and
/// `#[tokio_timeout_test(10, paused)]` are accepted. Paused tests need the
/// `test-util` feature of tokio in the calling crate.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as TimeoutArgs);
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_tokio_test_attribute(attr))
        .collect();

    // A paused clock auto-advances, so only the wall-clock watchdog bounds
    // paused tests.
    let body = if args.paused {
        quote! {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .start_paused(true)
                .build()
                .expect("failed to build Tokio runtime");
            runtime.block_on(async move #block);
        }
    } else {
        quote! {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build Tokio runtime");
            runtime.block_on(async {
                tokio::time::timeout(timeout_duration, async move #block)
                    .await
                    .expect("test timed out");
            });
        }
    };

    let watchdog = watchdog(args.timeout_secs, body);
    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            #watchdog
        }
    })
}

/// Runs a synchronous test on a watchdog thread and fails it once the timeout
/// elapses.
#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as TimeoutArgs);
    if args.paused {
        return syn::Error::new(
            proc_macro2::Span::call_site(),
            "`paused` is only supported by tokio_timeout_test",
        )
        .to_compile_error()
        .into();
    }
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout attribute expects a synchronous test function",
        )
        .to_compile_error()
        .into();
    }

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_attribute(attr))
        .collect();

    let watchdog = watchdog(args.timeout_secs, quote! { #block });
    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            #watchdog
        }
    })
}

fn watchdog(timeout_secs: u64, body: TokenStream2) -> TokenStream2 {
    quote! {
        let timeout_duration = std::time::Duration::from_secs(#timeout_secs);
        let (sender, receiver) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| { #body }));
            let _ = sender.send(result);
        });
        match receiver.recv_timeout(timeout_duration) {
            Ok(Ok(_)) => {}
            Ok(Err(payload)) => std::panic::resume_unwind(payload),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test thread failed before reporting result")
            }
        }
    }
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}

fn is_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!((segments.next(), segments.next()), (Some(first), None) if first.ident == "test")
}
