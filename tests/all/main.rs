mod publisher;
mod supervisor;
