mod exec;
mod support;
