mod command;
mod server;

pub use command::ClientId;
pub use command::GetArgs;
pub use command::GetReply;
pub use command::PutAppendArgs;
pub use command::PutAppendOp;
pub use command::PutAppendReply;
pub use server::KvConfig;
pub use server::KvServer;
