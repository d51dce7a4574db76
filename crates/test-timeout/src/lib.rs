use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

/// Runs an async test on a current-thread Tokio runtime with a wall-clock
/// guard.
///
/// Accepted arguments, in any order:
/// - `secs = N` (or a bare integer): timeout in seconds, default 30.
/// - `paused`: start the runtime with Tokio's clock paused so timers can be
///   driven with `tokio::time::advance`.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut options = TestOptions::default();
    if !attr.is_empty() {
        if let Ok(lit) = syn::parse::<LitInt>(attr.clone()) {
            match lit.base10_parse::<u64>() {
                Ok(value) => options.timeout_secs = value,
                Err(err) => return err.to_compile_error().into(),
            }
        } else {
            let parser = syn::meta::parser(|meta| options.parse(meta));
            parse_macro_input!(attr with parser);
        }
    }

    if options.timeout_secs == 0 {
        return syn::Error::new(
            proc_macro2::Span::call_site(),
            "timeout must be greater than zero",
        )
        .to_compile_error()
        .into();
    }

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

    let timeout = options.timeout_secs;
    // A paused clock is advanced by the test itself, so only the wall-clock
    // guard below applies.
    let runtime_setup = if options.paused {
        quote! {
            builder.start_paused(true);
            let runtime = builder.build().expect("failed to build Tokio runtime");
            runtime.block_on(async move #block);
        }
    } else {
        quote! {
            let runtime = builder.build().expect("failed to build Tokio runtime");
            runtime.block_on(async {
                tokio::time::timeout(timeout_duration, async move #block)
                    .await
                    .expect("test timed out");
            });
        }
    };

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            let timeout_duration = std::time::Duration::from_secs(#timeout);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let mut builder = tokio::runtime::Builder::new_current_thread();
                    builder.enable_all();
                    #runtime_setup
                }));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(timeout_duration + std::time::Duration::from_secs(1)) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

struct TestOptions {
    timeout_secs: u64,
    paused: bool,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            paused: false,
        }
    }
}

impl TestOptions {
    fn parse(&mut self, meta: syn::meta::ParseNestedMeta) -> syn::Result<()> {
        if meta.path.is_ident("paused") {
            self.paused = true;
            Ok(())
        } else if meta.path.is_ident("secs") {
            let lit: LitInt = meta.value()?.parse()?;
            self.timeout_secs = lit.base10_parse()?;
            Ok(())
        } else {
            Err(meta.error("expected `paused` or `secs = N`"))
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
