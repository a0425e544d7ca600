mod dispatch;
mod recovery;
