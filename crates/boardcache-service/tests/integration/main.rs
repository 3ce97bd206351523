mod caches;
mod http;
mod threads;
