//! The `A` demo service.

use tiderun::CallContext;
use tiderun::Handler;

pub const SERVICE: &str = "A";

pub struct Arith {
    name: String,
}

impl Arith {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    async fn add(&self, ctx: &mut CallContext, arg: i64, reply: &mut i64) -> anyhow::Result<()> {
        ctx.response_metadata.insert("served-by".into(), self.name.clone());
        *reply = arg.checked_add(1).ok_or_else(|| anyhow::anyhow!("{} + 1 overflows", arg))?;
        Ok(())
    }
}

pub fn handler(name: impl Into<String>) -> Handler {
    Handler::new(SERVICE, Arith::new(name))
        .method("Add", |svc: &Arith, ctx: &mut CallContext, arg: i64, reply: &mut i64| Box::pin(svc.add(ctx, arg, reply)))
        .into()
}
