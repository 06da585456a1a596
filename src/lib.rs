pub mod app;
pub mod config;
pub mod error;
pub mod state;

pub mod crypto {
    pub mod token;
}

pub mod models {
    pub mod session;
}

pub mod repositories {
    pub mod blob;
    pub mod session;
}

pub mod services {
    pub mod qr;
    pub mod sessions;
    pub mod sweeper;
    pub mod transfer;
}

pub mod handlers {
    pub mod files;
    pub mod health;
    pub mod respond;
    pub mod session;
}

pub mod middleware_layer {
    pub mod no_cache;
}

pub mod validation {
    pub mod upload;
}
