use std::sync::Arc;

use actix_web::{http, web, HttpResponse};

use crate::subst::Subst;

/// Fixed cache manifest. Priority 10 sorts us before the usual upstream
/// (priority 40) so the client asks here first; mass queries are declined
/// because every lookup costs an upstream round-trip.
pub(crate) async fn get(subst: web::Data<Arc<Subst>>) -> HttpResponse {
    subst.alive();
    HttpResponse::Ok()
        .insert_header((http::header::CONTENT_TYPE, "text/x-nix-cache-info"))
        .body("StoreDir: /nix/store\nWantMassQuery: 0\nPriority: 10\n")
}
