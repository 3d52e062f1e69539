mod discovery;
mod parsing;
