mod accounts;
mod cache;
